//! libSQL backend for the correlation store.
//!
//! Uses libsql's native async API over a local file or an in-memory
//! database. Mutations go through a writer lock so the select-then-delete
//! of `delete_by_origin` is atomic with respect to concurrent upserts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::correlation::{Correlation, CorrelationKey, CorrelationStore, migrations};
use crate::error::DatabaseError;
use crate::platform::{ChatId, MessageId};

/// libSQL correlation store.
pub struct LibSqlCorrelationStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    writer: Mutex<()>,
}

impl LibSqlCorrelationStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Correlation database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            writer: Mutex::new(()),
        })
    }

    /// Select the records matching `filter`, then delete them, under the writer lock.
    async fn take_where(
        &self,
        filter: &str,
        args: Vec<libsql::Value>,
        op: &str,
    ) -> Result<Vec<(ChatId, MessageId)>, DatabaseError> {
        let _guard = self.writer.lock().await;

        let mut rows = self
            .conn
            .query(
                &format!("SELECT target_chat, dest_id, suppressed FROM correlations WHERE {filter}"),
                args.clone(),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut relayed = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let suppressed: i64 = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
            if suppressed != 0 {
                continue;
            }
            let target: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
            let dest: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
            relayed.push((target, dest));
        }

        let removed = self
            .conn
            .execute(&format!("DELETE FROM correlations WHERE {filter}"), args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        debug!(removed, relayed = relayed.len(), "Correlation records deleted");
        Ok(relayed)
    }
}

#[async_trait]
impl CorrelationStore for LibSqlCorrelationStore {
    async fn put(&self, key: CorrelationKey, dest: MessageId) -> Result<(), DatabaseError> {
        let _guard = self.writer.lock().await;
        self.conn
            .execute(
                "INSERT INTO correlations (target_chat, source_chat, origin_id, dest_id, suppressed, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT(target_chat, source_chat, origin_id)
                 DO UPDATE SET dest_id = excluded.dest_id, suppressed = 0",
                params![key.target, key.source, key.origin, dest, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put: {e}")))?;

        debug!(
            target_chat = key.target,
            source_chat = key.source,
            origin = key.origin,
            dest,
            "Correlation stored"
        );
        Ok(())
    }

    async fn mark_suppressed(&self, key: CorrelationKey) -> Result<(), DatabaseError> {
        let _guard = self.writer.lock().await;
        self.conn
            .execute(
                "INSERT INTO correlations (target_chat, source_chat, origin_id, dest_id, suppressed, created_at)
                 VALUES (?1, ?2, ?3, ?3, 1, ?4)
                 ON CONFLICT(target_chat, source_chat, origin_id) DO NOTHING",
                params![key.target, key.source, key.origin, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_suppressed: {e}")))?;
        Ok(())
    }

    async fn lookup(&self, key: CorrelationKey) -> Result<Option<Correlation>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT dest_id, suppressed FROM correlations
                 WHERE target_chat = ?1 AND source_chat = ?2 AND origin_id = ?3",
                params![key.target, key.source, key.origin],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let dest: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("lookup row parse: {e}")))?;
                let suppressed: i64 = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("lookup row parse: {e}")))?;
                Ok(Some(if suppressed != 0 {
                    Correlation::Suppressed
                } else {
                    Correlation::Relayed(dest)
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("lookup: {e}"))),
        }
    }

    async fn delete_by_origin(
        &self,
        source: ChatId,
        origin: MessageId,
    ) -> Result<Vec<(ChatId, MessageId)>, DatabaseError> {
        self.take_where(
            "source_chat = ?1 AND origin_id = ?2",
            vec![source.into(), origin.into()],
            "delete_by_origin",
        )
        .await
    }

    async fn delete_by_origin_any_source(
        &self,
        origin: MessageId,
    ) -> Result<Vec<(ChatId, MessageId)>, DatabaseError> {
        self.take_where(
            "origin_id = ?1",
            vec![origin.into()],
            "delete_by_origin_any_source",
        )
        .await
    }

    async fn entries(&self) -> Result<Vec<(CorrelationKey, Correlation)>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT target_chat, source_chat, origin_id, dest_id, suppressed
                 FROM correlations ORDER BY target_chat, source_chat, origin_id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("entries: {e}")))?
        {
            let parse = |idx: i32| {
                row.get::<i64>(idx)
                    .map_err(|e| DatabaseError::Query(format!("entries row parse: {e}")))
            };
            let key = CorrelationKey::new(parse(0)?, parse(1)?, parse(2)?);
            let value = if parse(4)? != 0 {
                Correlation::Suppressed
            } else {
                Correlation::Relayed(parse(3)?)
            };
            entries.push((key, value));
        }
        Ok(entries)
    }

    async fn is_empty(&self) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM correlations", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("is_empty: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("is_empty: {e}")))?;
        match row {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("is_empty row parse: {e}")))?;
                Ok(count == 0)
            }
            None => Ok(true),
        }
    }
}
