//! Screen controllers: the glue between live data, the core operations and
//! whatever renders them.
//!
//! Each controller publishes render state on `watch` channels and reports
//! outcomes on the notification channel. None of them panic on failure;
//! errors are returned and notified.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::album::{AlbumAppender, AppendError};
use crate::blob_store::BlobStore;
use crate::document_store::{DocumentStore, Query};
use crate::download::{DownloadAgent, DownloadError};
use crate::live_sync::{LiveCollectionSync, SubscriptionError, SubscriptionHandle};
use crate::model::{DatedItem, ItemKind};
use crate::navigator::{NavigatorError, NavigatorState, PhotoNavigator};
use crate::notification::{Notification, Notifier};
use crate::session::{Forbidden, Session};
use crate::timeline::{partition, Timeline};
use crate::upload::{UploadError, UploadJob, UploadPipeline, UploadProgress};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shared services every screen is built from.
#[derive(Clone)]
pub struct ScreenContext {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub downloads: Arc<DownloadAgent>,
    pub notifier: Notifier,
}

impl ScreenContext {
    fn live_sync(&self) -> LiveCollectionSync {
        LiveCollectionSync::new(self.store.clone(), self.notifier.clone())
    }
}

/// Shortest and longest wait between re-partitions against the clock.
const MIN_REFRESH: Duration = Duration::from_secs(1);
const MAX_REFRESH: Duration = Duration::from_secs(60);

/// Lists of events or parties, split into the next one and the recent past.
///
/// The split is redone when a snapshot arrives and again once the clock
/// passes the date of `next`, so an item that started moves to the past
/// without waiting for a store change.
pub struct TimelineScreen {
    sync: LiveCollectionSync,
    notifier: Notifier,
    clock: Clock,
    items: Arc<Mutex<Vec<DatedItem>>>,
    timeline: Arc<watch::Sender<Timeline>>,
    subscription: Option<SubscriptionHandle>,
    refresher: Option<DropGuard>,
}

impl TimelineScreen {
    pub fn new(ctx: &ScreenContext) -> Self {
        Self::with_clock(ctx, Arc::new(Utc::now))
    }

    pub fn with_clock(ctx: &ScreenContext, clock: Clock) -> Self {
        let (timeline, _) = watch::channel(Timeline::default());
        Self {
            sync: ctx.live_sync(),
            notifier: ctx.notifier.clone(),
            clock,
            items: Arc::new(Mutex::new(Vec::new())),
            timeline: Arc::new(timeline),
            subscription: None,
            refresher: None,
        }
    }

    pub fn timeline(&self) -> watch::Receiver<Timeline> {
        self.timeline.subscribe()
    }

    /// Start following `query`, replacing any earlier subscription.
    pub async fn mount(&mut self, query: Query) -> Result<(), SubscriptionError> {
        self.unmount();

        let clock = self.clock.clone();
        let latest = self.items.clone();
        let timeline = self.timeline.clone();
        let handle = self
            .sync
            .subscribe_with(query, move |items| {
                let split = partition(&items, clock());
                *lock(&latest) = items;
                timeline.send_replace(split);
            })
            .await
            .inspect_err(|e| {
                self.notifier
                    .notify(Notification::error("Error", e.to_string()));
            })?;

        self.subscription = Some(handle);
        self.refresher = Some(self.spawn_refresher());
        Ok(())
    }

    pub fn unmount(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.cancel();
        }
        self.refresher = None;
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    /// Re-split the last snapshot against the clock. Returns whether the
    /// published timeline changed.
    pub fn refresh(&self) -> bool {
        refresh_timeline(&self.items, &self.timeline, &self.clock)
    }

    /// Sleeps until the current `next` is due, then re-splits. Stops when the
    /// returned guard is dropped.
    fn spawn_refresher(&self) -> DropGuard {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let items = self.items.clone();
        let timeline = self.timeline.clone();
        let clock = self.clock.clone();

        tokio::spawn(async move {
            let mut changes = timeline.subscribe();
            loop {
                let wait = changes
                    .borrow_and_update()
                    .next
                    .as_ref()
                    .map(|item| (item.date - clock()).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(MAX_REFRESH)
                    .clamp(MIN_REFRESH, MAX_REFRESH);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(wait) => {
                        if refresh_timeline(&items, &timeline, &clock) {
                            debug!("Timeline re-split after the clock passed the next item");
                        }
                    }
                }
            }
        });

        token.drop_guard()
    }
}

fn lock(items: &Mutex<Vec<DatedItem>>) -> std::sync::MutexGuard<'_, Vec<DatedItem>> {
    items.lock().unwrap_or_else(PoisonError::into_inner)
}

fn refresh_timeline(
    items: &Mutex<Vec<DatedItem>>,
    timeline: &watch::Sender<Timeline>,
    clock: &Clock,
) -> bool {
    let split = partition(&lock(items), clock());
    timeline.send_if_modified(|current| {
        if *current == split {
            false
        } else {
            *current = split;
            true
        }
    })
}

impl Drop for TimelineScreen {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[derive(Error, Debug)]
pub enum AlbumError {
    #[error(transparent)]
    Forbidden(#[from] Forbidden),
    #[error("An upload to {0} is already in progress")]
    Busy(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Append(#[from] AppendError),
    #[error(transparent)]
    Navigator(#[from] NavigatorError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// One item's photo album, with upload and the gallery.
pub struct AlbumScreen {
    kind: ItemKind,
    parent_id: String,
    session: Session,
    sync: LiveCollectionSync,
    pipeline: UploadPipeline,
    appender: AlbumAppender,
    downloads: Arc<DownloadAgent>,
    notifier: Notifier,
    photos: Arc<watch::Sender<Vec<String>>>,
    progress: Arc<watch::Sender<UploadProgress>>,
    /// Set while a batch owns `progress`.
    uploading: AtomicBool,
    navigator: PhotoNavigator,
    subscription: Option<SubscriptionHandle>,
}

/// Clears the screen's upload flag when the batch ends, however it ends.
struct UploadSlot<'a>(&'a AtomicBool);

impl<'a> UploadSlot<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for UploadSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AlbumScreen {
    pub fn new(ctx: &ScreenContext, session: Session, kind: ItemKind, parent_id: &str) -> Self {
        let (photos, _) = watch::channel(Vec::new());
        let (progress, _) = watch::channel(UploadProgress::default());
        Self {
            kind,
            parent_id: parent_id.to_string(),
            session,
            sync: ctx.live_sync(),
            pipeline: UploadPipeline::new(ctx.blobs.clone()),
            appender: AlbumAppender::new(ctx.store.clone()),
            downloads: ctx.downloads.clone(),
            notifier: ctx.notifier.clone(),
            photos: Arc::new(photos),
            progress: Arc::new(progress),
            uploading: AtomicBool::new(false),
            navigator: PhotoNavigator::new(),
            subscription: None,
        }
    }

    pub fn photos(&self) -> watch::Receiver<Vec<String>> {
        self.photos.subscribe()
    }

    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress.subscribe()
    }

    pub async fn mount(&mut self) -> Result<(), SubscriptionError> {
        self.unmount();

        let photos = self.photos.clone();
        let query = Query::document(self.kind.collection(), &self.parent_id);
        let handle = self
            .sync
            .subscribe_with(query, move |items| {
                let album = items.into_iter().next().map(|item| item.photos);
                photos.send_replace(album.unwrap_or_default());
            })
            .await
            .inspect_err(|e| {
                self.notifier
                    .notify(Notification::error("Error", e.to_string()));
            })?;

        self.subscription = Some(handle);
        Ok(())
    }

    pub fn unmount(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.cancel();
        }
    }

    /// Upload `local_refs` and append them to the album. Nothing is appended
    /// unless every file uploaded. One batch at a time: a call made while
    /// another is running returns `AlbumError::Busy` without uploading.
    pub async fn add_photos(
        &self,
        local_refs: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AlbumError> {
        let Some(_slot) = UploadSlot::claim(&self.uploading) else {
            info!(
                "Refusing second upload to {}/{} while one is running",
                self.kind.collection(),
                self.parent_id
            );
            self.notifier.notify(Notification::info(
                "Upload in progress",
                "Wait for the current upload to finish",
            ));
            return Err(AlbumError::Busy(format!(
                "{}/{}",
                self.kind.collection(),
                self.parent_id
            )));
        };

        let result = self.upload_and_append(local_refs, cancel).await;
        match &result {
            Ok(_) => self.notifier.notify(Notification::success(
                "Success",
                "Photos added successfully",
            )),
            Err(AlbumError::Upload(UploadError::Cancelled { .. })) => self
                .notifier
                .notify(Notification::info("Upload cancelled", "No photos were added")),
            // Lost every race for the album; the caller sees the error but
            // the user is not told separately.
            Err(AlbumError::Append(e @ AppendError::AppendConflict { .. })) => {
                warn!("Adding photos to {}/{} gave up: {}", self.kind.collection(), self.parent_id, e);
            }
            Err(e) => {
                error!("Adding photos to {}/{} failed: {}", self.kind.collection(), self.parent_id, e);
                self.notifier
                    .notify(Notification::error("Upload failed", e.to_string()));
            }
        }
        result
    }

    async fn upload_and_append(
        &self,
        local_refs: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AlbumError> {
        self.session.require_admin("add photos")?;

        let job = UploadJob::album(self.kind, &self.parent_id, local_refs);
        let urls = self
            .pipeline
            .run_with(&job, self.progress.clone(), cancel)
            .await?;
        let album = self.appender.append(self.kind, &self.parent_id, &urls).await?;

        info!(
            "Added {} photos to {}/{}",
            urls.len(),
            self.kind.collection(),
            self.parent_id
        );
        Ok(album)
    }

    pub fn open_gallery(&mut self, index: usize) -> Result<usize, NavigatorError> {
        let photos = self.photos.borrow().clone();
        self.navigator.open(photos, index)
    }

    pub fn next_photo(&mut self) -> Result<usize, NavigatorError> {
        self.refresh_gallery();
        self.navigator.next()
    }

    pub fn prev_photo(&mut self) -> Result<usize, NavigatorError> {
        self.refresh_gallery();
        self.navigator.prev()
    }

    pub fn close_gallery(&mut self) {
        self.navigator.close();
    }

    pub fn gallery(&self) -> NavigatorState {
        self.navigator.state()
    }

    /// Save the open photo to the download directory.
    pub async fn download_current(&self) -> Result<PathBuf, AlbumError> {
        let result = match self.navigator.current() {
            Some(url) => self.downloads.download(url).await.map_err(AlbumError::from),
            None => Err(NavigatorError::Closed.into()),
        };

        match &result {
            Ok(path) => self.notifier.notify(Notification::success(
                "Download complete",
                format!("Saved to {}", path.display()),
            )),
            Err(AlbumError::Download(DownloadError::PermissionDenied(_))) => self
                .notifier
                .notify(Notification::error(
                    "Permission denied",
                    "Allow access to your downloads to save photos",
                )),
            Err(e) => self
                .notifier
                .notify(Notification::error("Download failed", e.to_string())),
        }
        result
    }

    /// Pick up photos that arrived while the gallery is open.
    fn refresh_gallery(&mut self) {
        if self.navigator.cursor().is_some() {
            let latest = self.photos.borrow().clone();
            self.navigator.replace_items(latest);
        }
    }
}

impl Drop for AlbumScreen {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::{
        Document, DocumentFeed, Fields, SqliteDocumentStore, StoreError,
    };
    use crate::download::{DirectoryPermission, PermissionDenied, PermissionGate, WriteGrant};
    use crate::model::UserProfile;
    use crate::notification::Level;
    use crate::test_support::MemoryBlobStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    struct Deny;

    #[async_trait]
    impl PermissionGate for Deny {
        async fn acquire_write(&self, dir: &Path) -> Result<WriteGrant, PermissionDenied> {
            Err(PermissionDenied {
                dir: dir.to_path_buf(),
                reason: "declined".into(),
            })
        }
    }

    async fn context(
        gate: Arc<dyn PermissionGate>,
    ) -> (ScreenContext, Arc<SqliteDocumentStore>, mpsc::UnboundedReceiver<Notification>) {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().await.unwrap());
        let (notifier, rx) = Notifier::channel();
        let ctx = ScreenContext {
            store: store.clone(),
            blobs: Arc::new(MemoryBlobStore::new()),
            downloads: Arc::new(DownloadAgent::new(std::env::temp_dir(), gate)),
            notifier,
        };
        (ctx, store, rx)
    }

    /// Writes a small file per name and returns their paths.
    fn photo_files(dir: &Path, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                std::fs::write(&path, name.as_bytes()).unwrap();
                path.display().to_string()
            })
            .collect()
    }

    fn admin() -> Session {
        let profile: UserProfile =
            serde_json::from_value(json!({"uid": "u1", "role": "admin"})).unwrap();
        Session::new("t", profile)
    }

    async fn wait_for<T: Clone>(
        rx: &mut watch::Receiver<T>,
        pred: impl Fn(&T) -> bool,
    ) -> T {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return current;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("timed out waiting for state")
    }

    #[tokio::test]
    async fn timeline_screen_partitions_live_items() {
        let (ctx, store, _rx) = context(Arc::new(DirectoryPermission)).await;
        for (id, date) in [
            ("1", "2025-01-10T00:00:00Z"),
            ("2", "2025-03-01T00:00:00Z"),
            ("3", "2024-12-01T00:00:00Z"),
        ] {
            store
                .set("parties", id, fields(json!({"title": id, "date": date})))
                .await
                .unwrap();
        }

        let now = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let mut screen = TimelineScreen::with_clock(&ctx, Arc::new(move || now));
        screen.mount(Query::collection("parties")).await.unwrap();

        let mut timeline = screen.timeline();
        let state = wait_for(&mut timeline, |t| t.next.is_some()).await;
        assert_eq!(state.next.unwrap().id, "2");
        let past: Vec<_> = state.recent_past.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(past, vec!["1", "3"]);

        screen.unmount();
        screen.unmount();
        assert!(!screen.is_mounted());
    }

    #[tokio::test]
    async fn album_screen_gallery_and_denied_download() {
        let (ctx, store, mut rx) = context(Arc::new(Deny)).await;
        store
            .set(
                "events",
                "e1",
                fields(json!({
                    "title": "Kickoff",
                    "date": "2025-01-10T00:00:00Z",
                    "photos": ["https://blobs.test/a.jpg", "https://blobs.test/b.jpg"]
                })),
            )
            .await
            .unwrap();

        let mut screen = AlbumScreen::new(&ctx, admin(), ItemKind::Event, "e1");
        assert_eq!(screen.open_gallery(0), Err(NavigatorError::Empty));

        screen.mount().await.unwrap();
        let mut photos = screen.photos();
        wait_for(&mut photos, |p| p.len() == 2).await;

        assert_eq!(screen.open_gallery(0), Ok(0));
        assert_eq!(screen.prev_photo(), Ok(1));
        assert_eq!(screen.next_photo(), Ok(0));

        let err = screen.download_current().await.unwrap_err();
        assert!(matches!(
            err,
            AlbumError::Download(DownloadError::PermissionDenied(_))
        ));
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.level, Level::Error);
        assert_eq!(notification.title, "Permission denied");

        screen.close_gallery();
        assert_eq!(screen.gallery().cursor, None);
    }

    #[tokio::test]
    async fn timeline_moves_on_once_next_item_has_started() {
        let (ctx, store, _rx) = context(Arc::new(DirectoryPermission)).await;
        for (id, date) in [
            ("soon", "2025-02-02T00:00:00Z"),
            ("later", "2025-03-01T00:00:00Z"),
        ] {
            store
                .set("parties", id, fields(json!({"title": id, "date": date})))
                .await
                .unwrap();
        }

        let now = Arc::new(Mutex::new(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()));
        let clock_now = now.clone();
        let mut screen =
            TimelineScreen::with_clock(&ctx, Arc::new(move || *clock_now.lock().unwrap()));
        screen.mount(Query::collection("parties")).await.unwrap();

        let mut timeline = screen.timeline();
        let state = wait_for(&mut timeline, |t| t.next.is_some()).await;
        assert_eq!(state.next.unwrap().id, "soon");
        assert!(!screen.refresh());

        // No store change, only time passing.
        *now.lock().unwrap() = Utc.with_ymd_and_hms(2025, 2, 3, 0, 0, 0).unwrap();
        assert!(screen.refresh());

        let state = timeline.borrow_and_update().clone();
        assert_eq!(state.next.unwrap().id, "later");
        let past: Vec<_> = state.recent_past.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(past, vec!["soon"]);
    }

    #[tokio::test]
    async fn second_batch_is_refused_while_one_is_running() {
        let (ctx, store, mut rx) = context(Arc::new(DirectoryPermission)).await;
        store
            .set(
                "parties",
                "p1",
                fields(json!({"title": "Gala", "date": "2025-03-01T20:00:00Z", "photos": []})),
            )
            .await
            .unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        let first = photo_files(tmp.path(), &["a.jpg", "b.jpg"]);
        let second = photo_files(tmp.path(), &["c.jpg"]);

        let screen = AlbumScreen::new(&ctx, admin(), ItemKind::Party, "p1");
        let cancel = CancellationToken::new();
        let (running, refused) = tokio::join!(
            screen.add_photos(first, &cancel),
            screen.add_photos(second.clone(), &cancel),
        );
        assert_eq!(running.unwrap().len(), 2);
        assert!(matches!(refused, Err(AlbumError::Busy(_))));

        let busy = rx.recv().await.unwrap();
        assert_eq!(busy.level, Level::Info);
        assert_eq!(busy.title, "Upload in progress");
        assert_eq!(rx.recv().await.unwrap().level, Level::Success);

        // Progress belongs to the batch that ran, untouched by the refused one.
        let progress = *screen.progress().borrow();
        assert_eq!(progress.total_files, 2);
        assert!(progress.is_complete());

        // The slot is free again once the batch is done.
        let album = screen.add_photos(second, &cancel).await.unwrap();
        assert_eq!(album.len(), 3);
    }

    /// Every conditional write loses to some other writer.
    struct ContendedStore(Arc<SqliteDocumentStore>);

    #[async_trait]
    impl DocumentStore for ContendedStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
            self.0.get(collection, id).await
        }
        async fn list(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
            self.0.list(query).await
        }
        async fn add(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
            self.0.add(collection, fields).await
        }
        async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
            self.0.set(collection, id, fields).await
        }
        async fn merge_fields(
            &self,
            _collection: &str,
            _id: &str,
            _fields: Fields,
            _expected_version: Option<u64>,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Conflict("database is locked".into()))
        }
        async fn watch(&self, query: Query) -> Result<DocumentFeed, StoreError> {
            self.0.watch(query).await
        }
    }

    #[tokio::test]
    async fn append_conflict_is_returned_but_not_notified() {
        let (mut ctx, store, mut rx) = context(Arc::new(DirectoryPermission)).await;
        store
            .set(
                "events",
                "e1",
                fields(json!({"title": "Kickoff", "date": "2025-01-10T00:00:00Z"})),
            )
            .await
            .unwrap();
        ctx.store = Arc::new(ContendedStore(store));
        let tmp = tempfile::TempDir::new().unwrap();

        let screen = AlbumScreen::new(&ctx, admin(), ItemKind::Event, "e1");
        let err = screen
            .add_photos(photo_files(tmp.path(), &["a.jpg"]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AlbumError::Append(AppendError::AppendConflict { .. })
        ));
        assert!(rx.try_recv().is_err());
    }
}
