//! SQLite-backed document store.
//!
//! Every collection lives in the single `documents` table, keyed by
//! `(collection, id)` and indexed on the stamp used for window scans. Scans
//! page with a `(stamp, id)` keyset so no statement stays open between
//! batches; a multi-hour scan therefore cannot be cut off by an idle cursor.

use super::{DocumentStore, DocumentStream, StoreError, StoreResult, connect_sqlite};
use crate::models::{
    document::{BulkWriteSummary, Document, merge_top_level},
    window::TransferWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{TryStreamExt, stream};
use serde_json::Value;
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tracing::{debug, warn};

/// Position after the last document handed out: `(stamp_ms, id)`.
type Cursor = Option<(i64, String)>;

#[derive(FromRow)]
struct DocumentRow {
    id: String,
    stamp_ms: i64,
    body: String,
}

impl DocumentRow {
    fn into_document(self, collection: &str) -> StoreResult<Document> {
        let stamp = match DateTime::<Utc>::from_timestamp_millis(self.stamp_ms) {
            Some(stamp) => stamp,
            None => {
                return Err(StoreError::InvalidDocument {
                    collection: collection.to_string(),
                    id: self.id,
                    reason: format!("stamp {} out of range", self.stamp_ms),
                });
            }
        };
        match serde_json::from_str::<Value>(&self.body) {
            Ok(body) => Ok(Document {
                id: self.id,
                stamp,
                body,
            }),
            Err(err) => Err(StoreError::InvalidDocument {
                collection: collection.to_string(),
                id: self.id,
                reason: err.to_string(),
            }),
        }
    }
}

/// Document store over a shared SQLite pool.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pub db: Arc<SqlitePool>,
}

impl SqliteDocumentStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Connect to `database_url` and apply the schema.
    pub async fn open(database_url: &str) -> StoreResult<Self> {
        Ok(Self::new(Arc::new(connect_sqlite(database_url).await?)))
    }

    /// Fetch the batch following `cursor`, returning it with the next cursor.
    async fn next_batch(
        &self,
        collection: &str,
        end_ms: i64,
        limit: i64,
        cursor: Cursor,
    ) -> StoreResult<Option<(Vec<DocumentRow>, Cursor)>> {
        let Some((after_stamp, after_id)) = cursor else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, stamp_ms, body FROM documents
             WHERE collection = ? AND stamp_ms < ?
               AND (stamp_ms > ? OR (stamp_ms = ? AND id > ?))
             ORDER BY stamp_ms ASC, id ASC
             LIMIT ?",
        )
        .bind(collection)
        .bind(end_ms)
        .bind(after_stamp)
        .bind(after_stamp)
        .bind(&after_id)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;

        debug!("fetched batch of {} from {}", rows.len(), collection);

        if rows.is_empty() {
            return Ok(None);
        }
        let next = if (rows.len() as i64) < limit {
            None
        } else {
            rows.last().map(|row| (row.stamp_ms, row.id.clone()))
        };
        Ok(Some((rows, next)))
    }

    /// Insert or merge one document; `true` when it was inserted.
    async fn upsert_one(
        tx: &mut Transaction<'_, Sqlite>,
        collection: &str,
        doc: Document,
    ) -> StoreResult<bool> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT body FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(&doc.id)
                .fetch_optional(&mut **tx)
                .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO documents (collection, id, stamp_ms, body) VALUES (?, ?, ?, ?)",
                )
                .bind(collection)
                .bind(&doc.id)
                .bind(doc.stamp.timestamp_millis())
                .bind(doc.body.to_string())
                .execute(&mut **tx)
                .await?;
                Ok(true)
            }
            Some(raw) => {
                let mut body: Value =
                    serde_json::from_str(&raw).map_err(|err| StoreError::InvalidDocument {
                        collection: collection.to_string(),
                        id: doc.id.clone(),
                        reason: err.to_string(),
                    })?;
                merge_top_level(&mut body, doc.body);
                sqlx::query(
                    "UPDATE documents SET stamp_ms = ?, body = ? WHERE collection = ? AND id = ?",
                )
                .bind(doc.stamp.timestamp_millis())
                .bind(body.to_string())
                .bind(collection)
                .bind(&doc.id)
                .execute(&mut **tx)
                .await?;
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn scan<'a>(
        &'a self,
        collection: &'a str,
        window: TransferWindow,
        batch_size: usize,
    ) -> DocumentStream<'a> {
        let end_ms = window.end().timestamp_millis();
        let limit = batch_size.max(1) as i64;
        let start: Cursor = Some((window.start().timestamp_millis(), String::new()));

        let batches = stream::try_unfold(start, move |cursor| {
            self.next_batch(collection, end_ms, limit, cursor)
        });

        Box::pin(
            batches
                .map_ok(move |rows| {
                    stream::iter(rows.into_iter().map(move |row| row.into_document(collection)))
                })
                .try_flatten(),
        )
    }

    async fn count(&self, collection: &str, window: TransferWindow) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents \
             WHERE collection = ? AND stamp_ms >= ? AND stamp_ms < ?",
        )
        .bind(collection)
        .bind(window.start().timestamp_millis())
        .bind(window.end().timestamp_millis())
        .fetch_one(&*self.db)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn find_one(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, stamp_ms, body FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        row.map(|row| row.into_document(collection)).transpose()
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> StoreResult<BulkWriteSummary> {
        let mut summary = BulkWriteSummary::default();
        if docs.is_empty() {
            return Ok(summary);
        }

        let mut tx = self.db.begin().await?;
        for doc in docs {
            let id = doc.id.clone();
            match Self::upsert_one(&mut tx, collection, doc).await {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.updated += 1,
                Err(err) => {
                    warn!("upsert of {} into {} failed: {}", id, collection, err);
                    summary.errors += 1;
                }
            }
        }
        tx.commit().await?;

        Ok(summary)
    }
}
