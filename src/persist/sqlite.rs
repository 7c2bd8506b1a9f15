//! Embedded SQLite persistence backend (sqlx).

use super::{AggregateKind, Backend, EventRecord, KeyedLocks, NewEvent};
use crate::error::{Result, StoreError};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use std::path::Path;
use std::sync::Arc;

/// SQLite-backed [`Backend`] with a normalized schema: one `events` log table
/// plus one table per mutable aggregate.
pub struct SqliteBackend {
    pool: SqlitePool,
    /// Serializes appends per channel and writes per aggregate id.
    locks: KeyedLocks,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path` and run the schema.
    pub async fn connect(path: &Path) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(StoreError::Database)?;

        let backend = Self {
            pool,
            locks: KeyedLocks::new(),
        };
        backend.migrate().await?;
        Ok(Arc::new(backend))
    }

    /// In-memory SQLite, used by tests that want the SQL path.
    pub async fn connect_ephemeral() -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::Database)?;
        let backend = Self {
            pool,
            locks: KeyedLocks::new(),
        };
        backend.migrate().await?;
        Ok(Arc::new(backend))
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                channel_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                message_id TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                ts TEXT NOT NULL,
                payload_blob TEXT NOT NULL,
                PRIMARY KEY (channel_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create events table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_channel ON events(channel_id, position)")
            .execute(&self.pool)
            .await
            .context("failed to create events index")?;

        for kind in AggregateKind::ALL {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                kind.table()
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create {} table", kind.table()))?;
        }

        Ok(())
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord> {
        let ts_raw: String = row.try_get("ts").map_err(StoreError::Database)?;
        let ts: DateTime<Utc> = ts_raw
            .parse()
            .map_err(|error| StoreError::Query(format!("bad ts column: {error}")))?;
        let payload_raw: String = row.try_get("payload_blob").map_err(StoreError::Database)?;
        let payload = serde_json::from_str(&payload_raw)
            .map_err(|error| StoreError::Query(format!("bad payload column: {error}")))?;
        Ok(EventRecord {
            position: row
                .try_get::<i64, _>("position")
                .map_err(StoreError::Database)? as u64,
            message_id: row.try_get("message_id").map_err(StoreError::Database)?,
            message_type: row.try_get("type").map_err(StoreError::Database)?,
            ts,
            payload,
        })
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[async_trait::async_trait]
impl Backend for SqliteBackend {
    async fn append_event(&self, channel_id: &str, event: NewEvent) -> Result<u64> {
        let lock = self.locks.lock_for(&format!("log:{channel_id}"));
        let _guard = lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open append transaction")?;

        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM events WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to allocate event position")?;

        let insert = sqlx::query(
            r#"
            INSERT INTO events (channel_id, position, message_id, type, ts, payload_blob)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel_id)
        .bind(position)
        .bind(&event.message_id)
        .bind(&event.message_type)
        .bind(event.ts.to_rfc3339())
        .bind(event.payload.to_string())
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::DuplicateMessageId {
                    message_id: event.message_id,
                }
                .into());
            }
            Err(error) => return Err(StoreError::Database(error).into()),
        }

        tx.commit().await.context("failed to commit append")?;
        Ok(position as u64)
    }

    async fn scan_events(
        &self,
        channel_id: &str,
        from_position: u64,
        limit: Option<u32>,
    ) -> Result<Vec<EventRecord>> {
        let rows = match limit {
            Some(limit) => {
                sqlx::query(
                    r#"
                    SELECT channel_id, position, message_id, type, ts, payload_blob
                    FROM events WHERE channel_id = ? AND position >= ?
                    ORDER BY position ASC LIMIT ?
                    "#,
                )
                .bind(channel_id)
                .bind(from_position.max(1) as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT channel_id, position, message_id, type, ts, payload_blob
                    FROM events WHERE channel_id = ? AND position >= ?
                    ORDER BY position ASC
                    "#,
                )
                .bind(channel_id)
                .bind(from_position.max(1) as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to scan events")?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn replace_events(
        &self,
        channel_id: &str,
        first: u64,
        last: u64,
        summary: NewEvent,
    ) -> Result<u64> {
        let lock = self.locks.lock_for(&format!("log:{channel_id}"));
        let _guard = lock.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open replace transaction")?;

        sqlx::query("DELETE FROM events WHERE channel_id = ? AND position BETWEEN ? AND ?")
            .bind(channel_id)
            .bind(first as i64)
            .bind(last as i64)
            .execute(&mut *tx)
            .await
            .context("failed to delete compacted run")?;

        let insert = sqlx::query(
            r#"
            INSERT INTO events (channel_id, position, message_id, type, ts, payload_blob)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel_id)
        .bind(first as i64)
        .bind(&summary.message_id)
        .bind(&summary.message_type)
        .bind(summary.ts.to_rfc3339())
        .bind(summary.payload.to_string())
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::DuplicateMessageId {
                    message_id: summary.message_id,
                }
                .into());
            }
            Err(error) => return Err(StoreError::Database(error).into()),
        }

        tx.commit().await.context("failed to commit replace")?;
        Ok(first)
    }

    async fn list_channels(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT channel_id FROM events ORDER BY channel_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list channels")?;
        Ok(rows)
    }

    async fn put_aggregate(
        &self,
        kind: AggregateKind,
        id: &str,
        body: serde_json::Value,
    ) -> Result<()> {
        let lock = self.locks.lock_for(&format!("{kind}:{id}"));
        let _guard = lock.lock().await;

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, body, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at
            "#,
            kind.table()
        ))
        .bind(id)
        .bind(body.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert {kind} aggregate"))?;
        Ok(())
    }

    async fn get_aggregate(
        &self,
        kind: AggregateKind,
        id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let row: Option<String> =
            sqlx::query_scalar(&format!("SELECT body FROM {} WHERE id = ?", kind.table()))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to read {kind} aggregate"))?;
        match row {
            Some(body) => Ok(Some(serde_json::from_str(&body).map_err(|error| {
                StoreError::Query(format!("bad aggregate body: {error}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn delete_aggregate(&self, kind: AggregateKind, id: &str) -> Result<bool> {
        let lock = self.locks.lock_for(&format!("{kind}:{id}"));
        let _guard = lock.lock().await;

        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete {kind} aggregate"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_aggregates(
        &self,
        kind: AggregateKind,
    ) -> Result<Vec<(String, serde_json::Value)>> {
        let rows = sqlx::query(&format!(
            "SELECT id, body FROM {} ORDER BY id",
            kind.table()
        ))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list {kind} aggregates"))?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(StoreError::Database)?;
                let body: String = row.try_get("body").map_err(StoreError::Database)?;
                let value = serde_json::from_str(&body)
                    .map_err(|error| StoreError::Query(format!("bad aggregate body: {error}")))?;
                Ok((id, value))
            })
            .collect()
    }
}
