//! Sequential multi-file upload to the blob store.
//!
//! Files are uploaded one at a time, in order. Progress is folded into one
//! `UploadProgress` value published on a `watch` channel, and the batch is
//! all-or-nothing: any failure (or cancellation between files) discards
//! the URLs already obtained and returns an error.
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::blob_store::{BlobStore, BlobStoreError};
use crate::model::ItemKind;
use crate::util::{content_type_for_extension, extension_of};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UploadProgress {
    pub completed_files: usize,
    pub total_files: usize,
    /// Fraction of the in-flight file accepted by the store, in `[0, 1]`.
    pub current_file_fraction: f64,
}

impl UploadProgress {
    pub fn new(total_files: usize) -> Self {
        Self {
            completed_files: 0,
            total_files,
            current_file_fraction: 0.0,
        }
    }

    /// `(completed + current) / total`, 0 for an empty job.
    pub fn fraction(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        let done = self.completed_files as f64 + self.current_file_fraction;
        (done / self.total_files as f64).clamp(0.0, 1.0)
    }

    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).round() as u8
    }

    pub fn is_complete(&self) -> bool {
        self.total_files > 0 && self.completed_files == self.total_files
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Nothing to upload")]
    Empty,
    #[error("Failed to read file {index} ({path}): {source}")]
    Read {
        index: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to upload file {index}: {source}")]
    Blob {
        index: usize,
        #[source]
        source: BlobStoreError,
    },
    #[error("Upload cancelled after {completed} of {total} files")]
    Cancelled { completed: usize, total: usize },
}

impl UploadError {
    /// Index of the file that failed, if a particular file did.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            UploadError::Read { index, .. } | UploadError::Blob { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// One user action's worth of files and where they go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub local_refs: Vec<String>,
    pub namespace: String,
    pub parent_id: Option<String>,
}

impl UploadJob {
    pub fn new(local_refs: Vec<String>, namespace: impl Into<String>) -> Self {
        Self {
            local_refs,
            namespace: namespace.into(),
            parent_id: None,
        }
    }

    /// Photos for the album of an event or party.
    pub fn album(kind: ItemKind, parent_id: &str, local_refs: Vec<String>) -> Self {
        Self {
            local_refs,
            namespace: format!("{}/{}", kind.album_namespace(), parent_id),
            parent_id: Some(parent_id.to_string()),
        }
    }
}

/// Turns a local reference (`file://` URI or plain path) into a path.
pub fn resolve_local_ref(reference: &str) -> PathBuf {
    match reference.strip_prefix("file://") {
        Some(rest) => match urlencoding::decode(rest) {
            Ok(decoded) => PathBuf::from(decoded.into_owned()),
            Err(_) => PathBuf::from(rest),
        },
        None => PathBuf::from(reference),
    }
}

fn object_key(namespace: &str, millis: i64, index: usize, ext: Option<&str>) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let stem = format!("{}/{}-{}-{}", namespace, millis, index, &nonce[..8]);
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

/// Publishes progress, dropping any update that would move it backwards.
#[derive(Clone)]
struct ProgressTracker {
    tx: Arc<watch::Sender<UploadProgress>>,
}

impl ProgressTracker {
    fn publish(&self, candidate: UploadProgress) {
        self.tx.send_if_modified(|current| {
            if candidate.fraction() < current.fraction() || candidate == *current {
                return false;
            }
            *current = candidate;
            true
        });
    }

    fn start(&self, total_files: usize) {
        self.tx.send_replace(UploadProgress::new(total_files));
    }
}

pub struct UploadPipeline {
    blobs: Arc<dyn BlobStore>,
}

impl UploadPipeline {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Upload every file of `job` and return their URLs in file order.
    pub async fn run(&self, job: &UploadJob) -> Result<Vec<String>, UploadError> {
        let (tx, _rx) = watch::channel(UploadProgress::default());
        self.run_with(job, Arc::new(tx), &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), publishing progress on `progress` and
    /// checking `cancel` before each file.
    pub async fn run_with(
        &self,
        job: &UploadJob,
        progress: Arc<watch::Sender<UploadProgress>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, UploadError> {
        let total = job.local_refs.len();
        if total == 0 {
            return Err(UploadError::Empty);
        }

        info!("Uploading {} files to {}", total, job.namespace);
        let tracker = ProgressTracker { tx: progress };
        tracker.start(total);

        let mut urls = Vec::with_capacity(total);
        for (index, reference) in job.local_refs.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(
                    "Upload to {} cancelled after {}/{} files, discarding",
                    job.namespace, index, total
                );
                return Err(UploadError::Cancelled {
                    completed: index,
                    total,
                });
            }

            let url = self
                .upload_one(&job.namespace, index, reference, total, &tracker)
                .await
                .inspect_err(|e| {
                    error!(
                        "Upload batch to {} failed at file {}/{}: {}",
                        job.namespace,
                        index + 1,
                        total,
                        e
                    )
                })?;
            urls.push(url);

            tracker.publish(UploadProgress {
                completed_files: index + 1,
                total_files: total,
                current_file_fraction: 0.0,
            });
        }

        info!("Uploaded {} files to {}", total, job.namespace);
        Ok(urls)
    }

    async fn upload_one(
        &self,
        namespace: &str,
        index: usize,
        reference: &str,
        total: usize,
        tracker: &ProgressTracker,
    ) -> Result<String, UploadError> {
        let path = resolve_local_ref(reference);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|source| UploadError::Read {
                index,
                path: path.clone(),
                source,
            })?;

        let ext = extension_of(reference);
        let content_type = ext
            .as_deref()
            .map(content_type_for_extension)
            .unwrap_or("application/octet-stream");
        let key = object_key(namespace, Utc::now().timestamp_millis(), index, ext.as_deref());
        debug!("File {}/{}: {} bytes -> {}", index + 1, total, data.len(), key);

        let on_progress = {
            let tracker = tracker.clone();
            Box::new(move |sent: u64, size: u64| {
                let fraction = if size == 0 {
                    1.0
                } else {
                    (sent as f64 / size as f64).clamp(0.0, 1.0)
                };
                tracker.publish(UploadProgress {
                    completed_files: index,
                    total_files: total,
                    current_file_fraction: fraction,
                });
            })
        };

        let handle = self
            .blobs
            .put(&key, data, content_type, on_progress)
            .await
            .map_err(|source| UploadError::Blob { index, source })?;
        self.blobs
            .download_url(&handle)
            .await
            .map_err(|source| UploadError::Blob { index, source })
    }
}
