//! SQLite-backed document store.
//!
//! Documents are stored as JSON text in one table. Every write bumps a
//! store-wide revision on a `watch` channel; live queries re-run their
//! query whenever the revision moves.
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

use super::{Document, DocumentFeed, DocumentStore, Fields, Query, Selector, StoreError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    version INTEGER NOT NULL,
    fields TEXT NOT NULL,
    PRIMARY KEY (collection, id)
)";

#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    revision: std::sync::Arc<watch::Sender<u64>>,
}

impl SqliteDocumentStore {
    /// Open (creating if needed) a store backed by a database file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("Opened document store at {}", path.display());
        Self::with_pool(pool).await
    }

    /// A private in-memory store. Single connection, since every SQLite
    /// memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        let (revision, _) = watch::channel(0u64);
        Ok(Self {
            pool,
            revision: std::sync::Arc::new(revision),
        })
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// SQLITE_BUSY and its extended codes (e.g. 517, BUSY_SNAPSHOT) mean another
/// writer holds the lock; callers treat that like a lost race.
fn busy_as_conflict(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        let busy = db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| code & 0xff == 5);
        if busy {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Database(err)
}

fn row_to_document(id: String, version: i64, fields: &str) -> Result<Document, StoreError> {
    let fields: Fields = serde_json::from_str(fields)?;
    Ok(Document {
        id,
        version: version as u64,
        fields,
    })
}

async fn fetch_one(
    pool: &SqlitePool,
    collection: &str,
    id: &str,
) -> Result<Option<Document>, StoreError> {
    let row: Option<(String, i64, String)> = sqlx::query_as(
        "SELECT id, version, fields FROM documents WHERE collection = ? AND id = ?",
    )
    .bind(collection)
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|(id, version, fields)| row_to_document(id, version, &fields))
        .transpose()
}

async fn fetch_matching(pool: &SqlitePool, query: &Query) -> Result<Vec<Document>, StoreError> {
    if let Selector::Id(id) = &query.selector {
        return Ok(fetch_one(pool, &query.collection, id)
            .await?
            .into_iter()
            .collect());
    }

    let rows: Vec<(String, i64, String)> = sqlx::query_as(
        "SELECT id, version, fields FROM documents WHERE collection = ? ORDER BY id",
    )
    .bind(&query.collection)
    .fetch_all(pool)
    .await?;

    let mut docs = Vec::with_capacity(rows.len());
    for (id, version, fields) in rows {
        let doc = row_to_document(id, version, &fields)?;
        if query.matches(&doc) {
            docs.push(doc);
        }
    }
    Ok(docs)
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        fetch_one(&self.pool, collection, id).await
    }

    async fn list(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        fetch_matching(&self.pool, query).await
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let json = serde_json::to_string(&fields)?;

        sqlx::query("INSERT INTO documents (collection, id, version, fields) VALUES (?, ?, 1, ?)")
            .bind(collection)
            .bind(&id)
            .bind(json)
            .execute(&self.pool)
            .await?;

        debug!("Added {}/{}", collection, id);
        self.bump_revision();
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        let json = serde_json::to_string(&fields)?;

        sqlx::query(
            "INSERT INTO documents (collection, id, version, fields) VALUES (?, ?, 1, ?)
             ON CONFLICT (collection, id)
             DO UPDATE SET fields = excluded.fields, version = documents.version + 1",
        )
        .bind(collection)
        .bind(id)
        .bind(json)
        .execute(&self.pool)
        .await?;

        debug!("Set {}/{}", collection, id);
        self.bump_revision();
        Ok(())
    }

    async fn merge_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        // IMMEDIATE takes the write lock up front, so concurrent writers queue
        // on the busy timeout instead of failing the read-to-write upgrade.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(busy_as_conflict)?;

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT version, fields FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(busy_as_conflict)?;

        let (version, stored) = row.ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        let version = version as u64;

        if let Some(expected) = expected_version {
            if expected != version {
                return Err(StoreError::VersionMismatch {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    expected,
                    actual: version,
                });
            }
        }

        let mut merged: Fields = serde_json::from_str(&stored)?;
        merged.extend(fields);
        let json = serde_json::to_string(&merged)?;
        let new_version = version + 1;

        let updated = sqlx::query(
            "UPDATE documents SET fields = ?, version = ? WHERE collection = ? AND id = ? AND version = ?",
        )
        .bind(json)
        .bind(new_version as i64)
        .bind(collection)
        .bind(id)
        .bind(version as i64)
        .execute(&mut *tx)
        .await
        .map_err(busy_as_conflict)?;

        if updated.rows_affected() != 1 {
            return Err(StoreError::Conflict(format!(
                "{collection}/{id} changed during merge"
            )));
        }

        tx.commit().await.map_err(busy_as_conflict)?;

        debug!("Merged {}/{} -> v{}", collection, id, new_version);
        self.bump_revision();
        Ok(new_version)
    }

    async fn watch(&self, query: Query) -> Result<DocumentFeed, StoreError> {
        // Fail here rather than on the first emission if the database is gone.
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        let pool = self.pool.clone();
        let feed = WatchStream::new(self.revision.subscribe())
            .then(move |_| {
                let pool = pool.clone();
                let query = query.clone();
                async move { fetch_matching(&pool, &query).await }
            })
            .boxed();
        Ok(feed)
    }
}
