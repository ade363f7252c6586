//! Live subscriptions to a filtered collection.
//!
//! A `LiveSubscription` is a stream of full snapshots: the current state
//! first, then one snapshot per change, until it is cancelled, dropped, or
//! the store fails. Store failures end the stream and are reported on the
//! notification side channel; nothing here retries.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::document_store::{Document, DocumentStore, Query, StoreError};
use crate::model::DatedItem;
use crate::notification::{Notification, Notifier};

/// A full materialized view of the subscribed collection.
pub type Snapshot = Vec<DatedItem>;

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("Could not subscribe to {collection}: {source}")]
    Establish {
        collection: String,
        #[source]
        source: StoreError,
    },
}

/// Cancels a subscription. Cloneable; cancelling twice is a no-op.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("Cancelling live subscription");
            self.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct LiveSubscription {
    snapshots: BoxStream<'static, Snapshot>,
    handle: SubscriptionHandle,
}

impl LiveSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Stream for LiveSubscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        self.snapshots.poll_next_unpin(cx)
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Opens live subscriptions against a document store.
#[derive(Clone)]
pub struct LiveCollectionSync {
    store: Arc<dyn DocumentStore>,
    notifier: Notifier,
}

impl LiveCollectionSync {
    pub fn new(store: Arc<dyn DocumentStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    pub async fn subscribe(&self, query: Query) -> Result<LiveSubscription, SubscriptionError> {
        let collection = query.collection.clone();
        let feed = self.store.watch(query).await.map_err(|source| {
            error!("Failed to subscribe to {}: {}", collection, source);
            SubscriptionError::Establish {
                collection: collection.clone(),
                source,
            }
        })?;

        info!("Live subscription opened on {}", collection);

        let token = CancellationToken::new();
        let notifier = self.notifier.clone();
        let snapshots = feed
            .take_until(token.clone().cancelled_owned())
            .scan(collection, move |collection, batch| {
                let next = match batch {
                    Ok(docs) => Some(to_snapshot(collection, docs)),
                    Err(e) => {
                        error!("Live subscription on {} failed: {}", collection, e);
                        notifier.notify(Notification::error(
                            "Error",
                            format!("Lost connection to {collection}, pull to refresh."),
                        ));
                        None
                    }
                };
                futures::future::ready(next)
            })
            .boxed();

        Ok(LiveSubscription {
            snapshots,
            handle: SubscriptionHandle { token },
        })
    }

    /// Callback form: `on_snapshot` runs on a spawned task for every
    /// snapshot until the returned handle is cancelled.
    pub async fn subscribe_with<F>(
        &self,
        query: Query,
        mut on_snapshot: F,
    ) -> Result<SubscriptionHandle, SubscriptionError>
    where
        F: FnMut(Snapshot) + Send + 'static,
    {
        let mut subscription = self.subscribe(query).await?;
        let handle = subscription.handle();

        tokio::spawn(async move {
            while let Some(snapshot) = subscription.next().await {
                on_snapshot(snapshot);
            }
            debug!("Live subscription task finished");
        });

        Ok(handle)
    }
}

/// Malformed documents are skipped so one bad record doesn't blank a screen.
fn to_snapshot(collection: &str, docs: Vec<Document>) -> Snapshot {
    let mut items = Vec::with_capacity(docs.len());
    for doc in &docs {
        match DatedItem::from_document(doc) {
            Ok(item) => items.push(item),
            Err(e) => warn!("Skipping malformed {}/{}: {}", collection, doc.id, e),
        }
    }
    debug!("Snapshot of {}: {} items", collection, items.len());
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::{DocumentFeed, Fields, SqliteDocumentStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    async fn next_snapshot(sub: &mut LiveSubscription) -> Option<Snapshot> {
        tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timed out waiting for snapshot")
    }

    #[tokio::test]
    async fn first_snapshot_is_current_state_even_when_empty() {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().await.unwrap());
        let (notifier, _rx) = Notifier::channel();
        let sync = LiveCollectionSync::new(store, notifier);

        let mut sub = sync.subscribe(Query::collection("parties")).await.unwrap();
        assert_eq!(next_snapshot(&mut sub).await, Some(vec![]));
    }

    #[tokio::test]
    async fn changes_are_delivered_as_full_snapshots() {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().await.unwrap());
        let (notifier, _rx) = Notifier::channel();
        let sync = LiveCollectionSync::new(store.clone(), notifier);

        let mut sub = sync
            .subscribe(Query::collection("events").where_eq("associationId", "bde"))
            .await
            .unwrap();
        next_snapshot(&mut sub).await.unwrap();

        store
            .set(
                "events",
                "e1",
                fields(json!({"title": "Kickoff", "date": "2025-01-10T00:00:00Z", "associationId": "bde"})),
            )
            .await
            .unwrap();

        let snapshot = next_snapshot(&mut sub).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].title, "Kickoff");
    }

    #[tokio::test]
    async fn malformed_documents_are_skipped() {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().await.unwrap());
        store
            .set("parties", "bad", fields(json!({"title": "no date"})))
            .await
            .unwrap();
        store
            .set(
                "parties",
                "good",
                fields(json!({"title": "Gala", "date": "2025-03-01T20:00:00Z"})),
            )
            .await
            .unwrap();
        let (notifier, _rx) = Notifier::channel();
        let sync = LiveCollectionSync::new(store, notifier);

        let mut sub = sync.subscribe(Query::collection("parties")).await.unwrap();
        let snapshot = next_snapshot(&mut sub).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "good");
    }

    #[tokio::test]
    async fn cancel_ends_stream_and_is_idempotent() {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().await.unwrap());
        let (notifier, _rx) = Notifier::channel();
        let sync = LiveCollectionSync::new(store, notifier);

        let mut sub = sync.subscribe(Query::collection("parties")).await.unwrap();
        next_snapshot(&mut sub).await.unwrap();

        let handle = sub.handle();
        handle.cancel();
        handle.cancel();
        sub.cancel();

        assert!(handle.is_cancelled());
        assert_eq!(next_snapshot(&mut sub).await, None);
    }

    struct UnreachableStore;

    #[async_trait]
    impl DocumentStore for UnreachableStore {
        async fn get(&self, _: &str, _: &str) -> Result<Option<Document>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn list(&self, _: &Query) -> Result<Vec<Document>, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn add(&self, _: &str, _: Fields) -> Result<String, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Fields) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn merge_fields(
            &self,
            _: &str,
            _: &str,
            _: Fields,
            _: Option<u64>,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
        async fn watch(&self, _: Query) -> Result<DocumentFeed, StoreError> {
            Err(StoreError::Unavailable("offline".into()))
        }
    }

    #[tokio::test]
    async fn establish_failure_is_returned() {
        let (notifier, _rx) = Notifier::channel();
        let sync = LiveCollectionSync::new(Arc::new(UnreachableStore), notifier);

        let err = sync
            .subscribe(Query::collection("parties"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SubscriptionError::Establish { ref collection, .. } if collection == "parties"));
    }

    struct FlakyStore;

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn get(&self, _: &str, _: &str) -> Result<Option<Document>, StoreError> {
            Ok(None)
        }
        async fn list(&self, _: &Query) -> Result<Vec<Document>, StoreError> {
            Ok(vec![])
        }
        async fn add(&self, _: &str, _: Fields) -> Result<String, StoreError> {
            Ok("id".into())
        }
        async fn set(&self, _: &str, _: &str, _: Fields) -> Result<(), StoreError> {
            Ok(())
        }
        async fn merge_fields(
            &self,
            _: &str,
            _: &str,
            _: Fields,
            _: Option<u64>,
        ) -> Result<u64, StoreError> {
            Ok(1)
        }
        async fn watch(&self, _: Query) -> Result<DocumentFeed, StoreError> {
            let batches: Vec<Result<Vec<Document>, StoreError>> = vec![
                Ok(vec![]),
                Err(StoreError::Unavailable("connection reset".into())),
                Ok(vec![]),
            ];
            Ok(futures::stream::iter(batches).boxed())
        }
    }

    #[tokio::test]
    async fn feed_error_ends_stream_and_notifies() {
        let (notifier, mut rx) = Notifier::channel();
        let sync = LiveCollectionSync::new(Arc::new(FlakyStore), notifier);

        let mut sub = sync.subscribe(Query::collection("parties")).await.unwrap();
        assert_eq!(next_snapshot(&mut sub).await, Some(vec![]));
        assert_eq!(next_snapshot(&mut sub).await, None);

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.level, crate::notification::Level::Error);
    }

    #[tokio::test]
    async fn callback_form_stops_after_cancel() {
        let store = Arc::new(SqliteDocumentStore::open_in_memory().await.unwrap());
        let (notifier, _rx) = Notifier::channel();
        let sync = LiveCollectionSync::new(store.clone(), notifier);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = sync
            .subscribe_with(Query::collection("parties"), move |snapshot| {
                let _ = tx.send(snapshot.len());
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(0));

        handle.cancel();
        // The task owns the sender; once it exits the channel closes.
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());

        store
            .set(
                "parties",
                "p1",
                fields(json!({"title": "Gala", "date": "2025-03-01T20:00:00Z"})),
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
