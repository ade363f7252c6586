//! Appending uploaded photo URLs to an item's album.
//!
//! The `photos` field is the one resource several uploaders write to. An
//! append always re-reads the document, merges onto that latest value and
//! writes back conditionally on the version it read, retrying from the
//! read when another writer got there first.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::document_store::{DocumentStore, Fields, StoreError};
use crate::model::ItemKind;

pub const MAX_APPEND_ATTEMPTS: usize = 8;

/// Upper bound of the jittered pause after the n-th lost race is n times this.
const BACKOFF_STEP_MS: u64 = 10;

const PHOTOS_FIELD: &str = "photos";

#[derive(Error, Debug)]
pub enum AppendError {
    #[error("{collection}/{id} does not exist")]
    NotFound { collection: String, id: String },
    #[error("Gave up appending to {collection}/{id} after {attempts} conflicting writes")]
    AppendConflict {
        collection: String,
        id: String,
        attempts: usize,
    },
    #[error("{collection}/{id} has a malformed photos field")]
    Malformed { collection: String, id: String },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Existing entries first, untouched, then every new URL not already present.
pub fn merge_photos(existing: &[String], new_urls: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = existing.iter().map(String::as_str).collect();
    let mut merged = existing.to_vec();
    for url in new_urls {
        if seen.insert(url.as_str()) {
            merged.push(url.clone());
        }
    }
    merged
}

fn photos_of(fields: &Fields) -> Option<Vec<String>> {
    match fields.get(PHOTOS_FIELD) {
        None | Some(Value::Null) => Some(vec![]),
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(_) => None,
    }
}

#[derive(Clone)]
pub struct AlbumAppender {
    store: Arc<dyn DocumentStore>,
}

impl AlbumAppender {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Append `new_urls` to the album of `kind`/`parent_id`, returning the
    /// album as written.
    pub async fn append(
        &self,
        kind: ItemKind,
        parent_id: &str,
        new_urls: &[String],
    ) -> Result<Vec<String>, AppendError> {
        let collection = kind.collection();

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let doc = self
                .store
                .get(collection, parent_id)
                .await?
                .ok_or_else(|| AppendError::NotFound {
                    collection: collection.to_string(),
                    id: parent_id.to_string(),
                })?;

            let existing = photos_of(&doc.fields).ok_or_else(|| AppendError::Malformed {
                collection: collection.to_string(),
                id: parent_id.to_string(),
            })?;
            let merged = merge_photos(&existing, new_urls);
            if merged.len() == existing.len() {
                debug!("{}/{}: nothing new to append", collection, parent_id);
                return Ok(merged);
            }

            let mut fields = Fields::new();
            fields.insert(
                PHOTOS_FIELD.to_string(),
                Value::Array(merged.iter().cloned().map(Value::String).collect()),
            );

            match self
                .store
                .merge_fields(collection, parent_id, fields, Some(doc.version))
                .await
            {
                Ok(version) => {
                    info!(
                        "Appended {} photos to {}/{} (now {}, v{})",
                        merged.len() - existing.len(),
                        collection,
                        parent_id,
                        merged.len(),
                        version
                    );
                    return Ok(merged);
                }
                Err(StoreError::VersionMismatch { actual, .. }) => {
                    warn!(
                        "{}/{} changed underneath append (read v{}, now v{}), attempt {}/{}",
                        collection, parent_id, doc.version, actual, attempt, MAX_APPEND_ATTEMPTS
                    );
                }
                Err(StoreError::Conflict(reason)) => {
                    warn!(
                        "{}/{} write lost to another writer ({}), attempt {}/{}",
                        collection, parent_id, reason, attempt, MAX_APPEND_ATTEMPTS
                    );
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < MAX_APPEND_ATTEMPTS {
                // Jitter keeps writers that lost together from colliding again.
                let pause = rand::thread_rng().gen_range(1..=BACKOFF_STEP_MS * attempt as u64);
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        }

        Err(AppendError::AppendConflict {
            collection: collection.to_string(),
            id: parent_id.to_string(),
            attempts: MAX_APPEND_ATTEMPTS,
        })
    }
}
