//! Document store abstraction.
//!
//! Collections of JSON documents keyed by id. Supports point reads,
//! equality-filtered queries, field merge-updates guarded by a per-document
//! version, and live queries that re-emit the full matching set on every
//! change.
pub mod sqlite;

pub use sqlite::SqliteDocumentStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use thiserror::Error;

pub type Fields = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("Version mismatch on {collection}/{id}: expected {expected}, found {actual}")]
    VersionMismatch {
        collection: String,
        id: String,
        expected: u64,
        actual: u64,
    },
    /// A concurrent write got in first; retrying from a fresh read is safe.
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// One stored document. `version` starts at 1 and grows on every write.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub version: u64,
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    All,
    FieldEq { field: String, value: Value },
    Id(String),
}

/// Which documents of a collection a read or live query covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub selector: Selector,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            selector: Selector::All,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.selector = Selector::FieldEq {
            field: field.into(),
            value: value.into(),
        };
        self
    }

    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            selector: Selector::Id(id.into()),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match &self.selector {
            Selector::All => true,
            Selector::FieldEq { field, value } => doc.fields.get(field) == Some(value),
            Selector::Id(id) => &doc.id == id,
        }
    }
}

/// Live query results: the full matching set, once per change.
pub type DocumentFeed = BoxStream<'static, Result<Vec<Document>, StoreError>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn list(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Create a document with a fresh id and return the id.
    async fn add(&self, collection: &str, fields: Fields) -> Result<String, StoreError>;

    /// Create or replace a document under a caller-chosen id.
    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError>;

    /// Overwrite the given top-level fields, leaving the others untouched.
    ///
    /// With `expected_version`, the write only happens if the stored version
    /// still matches, otherwise `StoreError::VersionMismatch`. A write that
    /// loses to a concurrent one fails with `StoreError::Conflict`. Returns
    /// the new version.
    async fn merge_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Emits the current matching set immediately, then again after changes.
    /// Consecutive changes may be coalesced into one emission.
    async fn watch(&self, query: Query) -> Result<DocumentFeed, StoreError>;
}
