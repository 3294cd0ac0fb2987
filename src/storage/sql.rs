// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the counter store and sync status.
//!
//! ```sql
//! CREATE TABLE message_counts (
//!   user_id      VARCHAR(32) NOT NULL,
//!   guild_id     VARCHAR(32) NOT NULL,
//!   channel_id   VARCHAR(32) NOT NULL,
//!   message_date CHAR(10)    NOT NULL,  -- YYYY-MM-DD (UTC)
//!   count        BIGINT      NOT NULL,
//!   PRIMARY KEY (user_id, guild_id, channel_id, message_date)
//! );
//!
//! CREATE TABLE sync_status (
//!   guild_id              VARCHAR(32) PRIMARY KEY,
//!   mode                  VARCHAR(16),
//!   phase                 VARCHAR(16) NOT NULL,
//!   last_checkpoint       VARCHAR(32),
//!   last_known_message_id VARCHAR(32),
//!   last_known_message_at BIGINT,       -- unix millis
//!   updated_at            BIGINT NOT NULL
//! );
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Dates are stored as `YYYY-MM-DD` text because the `Any` driver has no
//! chrono mapping. MySQL `SUM()` yields DECIMAL and `RANK()` yields an
//! unsigned integer, neither of which `Any` decodes, so both are cast to
//! SIGNED on MySQL.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};

use super::traits::{ArchiveStore, StorageError, UserTotal};
use crate::activity::{format_date, CounterKey, CounterRecord, LeaderboardFilter};
use crate::resilience::retry::{retry, RetryConfig};
use crate::sync::status::SyncStatus;
use crate::sync::types::{MessageAnchor, SyncPhase};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Rows per multi-row INSERT. 5 binds per row keeps us under SQLite's
/// 32766-variable limit and MySQL's default packet size.
pub const DEFAULT_UPSERT_CHUNK: usize = 1000;

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
    upsert_chunk: usize,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            upsert_chunk: DEFAULT_UPSERT_CHUNK,
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Override the rows-per-INSERT used inside upsert transactions.
    #[must_use]
    pub fn with_upsert_chunk(mut self, rows: usize) -> Self {
        self.upsert_chunk = rows.max(1);
        self
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS message_counts (
                    user_id TEXT NOT NULL,
                    guild_id TEXT NOT NULL,
                    channel_id TEXT NOT NULL,
                    message_date TEXT NOT NULL,
                    count INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (user_id, guild_id, channel_id, message_date)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_counts_guild_channel ON message_counts (guild_id, channel_id)",
                "CREATE INDEX IF NOT EXISTS idx_counts_guild_date ON message_counts (guild_id, message_date)",
                r#"
                CREATE TABLE IF NOT EXISTS sync_status (
                    guild_id TEXT PRIMARY KEY,
                    mode TEXT,
                    phase TEXT NOT NULL DEFAULT 'idle',
                    last_checkpoint TEXT,
                    last_known_message_id TEXT,
                    last_known_message_at INTEGER,
                    updated_at INTEGER NOT NULL
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS message_counts (
                    user_id VARCHAR(32) NOT NULL,
                    guild_id VARCHAR(32) NOT NULL,
                    channel_id VARCHAR(32) NOT NULL,
                    message_date CHAR(10) NOT NULL,
                    count BIGINT NOT NULL DEFAULT 0,
                    PRIMARY KEY (user_id, guild_id, channel_id, message_date),
                    INDEX idx_counts_guild_channel (guild_id, channel_id),
                    INDEX idx_counts_guild_date (guild_id, message_date)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_status (
                    guild_id VARCHAR(32) PRIMARY KEY,
                    mode VARCHAR(16),
                    phase VARCHAR(16) NOT NULL DEFAULT 'idle',
                    last_checkpoint VARCHAR(32),
                    last_known_message_id VARCHAR(32),
                    last_known_message_at BIGINT,
                    updated_at BIGINT NOT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn sum_expr(&self) -> &'static str {
        if self.is_sqlite {
            "SUM(count)"
        } else {
            "CAST(SUM(count) AS SIGNED)"
        }
    }

    fn upsert_sql(&self, rows: usize) -> String {
        let placeholders = vec!["(?, ?, ?, ?, ?)"; rows].join(", ");
        if self.is_sqlite {
            format!(
                "INSERT INTO message_counts (user_id, guild_id, channel_id, message_date, count) VALUES {} \
                 ON CONFLICT(user_id, guild_id, channel_id, message_date) \
                 DO UPDATE SET count = message_counts.count + excluded.count",
                placeholders
            )
        } else {
            format!(
                "INSERT INTO message_counts (user_id, guild_id, channel_id, message_date, count) VALUES {} \
                 ON DUPLICATE KEY UPDATE count = count + VALUES(count)",
                placeholders
            )
        }
    }

    async fn fetch_totals(
        &self,
        op: &str,
        guild_id: &str,
        filter: &LeaderboardFilter,
        page: Option<(usize, usize)>,
    ) -> Result<Vec<UserTotal>, StorageError> {
        let (where_sql, binds) = where_clause(guild_id, filter);
        let mut sql = format!(
            "SELECT user_id, {} AS total FROM message_counts WHERE {} GROUP BY user_id ORDER BY total DESC, user_id ASC",
            self.sum_expr(),
            where_sql
        );
        if page.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        retry(op, &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind.as_str());
            }
            if let Some((offset, limit)) = page {
                query = query.bind(limit as i64).bind(offset as i64);
            }
            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| -> Result<UserTotal, StorageError> {
                    let user_id = get_text(row, "user_id")?;
                    let total: i64 = row
                        .try_get("total")
                        .map_err(|e| StorageError::Decode(e.to_string()))?;
                    Ok(UserTotal::new(user_id, total.max(0) as u64))
                })
                .collect()
        })
        .await
    }
}

/// `WHERE` body and its text binds for a guild-scoped filter.
fn where_clause(guild_id: &str, filter: &LeaderboardFilter) -> (String, Vec<String>) {
    let mut clauses = vec!["guild_id = ?"];
    let mut binds = vec![guild_id.to_string()];
    if let Some(ref channel) = filter.channel_id {
        clauses.push("channel_id = ?");
        binds.push(channel.clone());
    }
    if let Some(date) = filter.date {
        clauses.push("message_date = ?");
        binds.push(format_date(date));
    }
    (clauses.join(" AND "), binds)
}

/// Read a text column; MySQL may hand VARCHAR back as bytes through `Any`.
fn get_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .or_else(|_| {
            row.try_get::<Vec<u8>, _>(column)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
        .map_err(|e| StorageError::Decode(format!("{column}: {e}")))
}

fn get_opt_text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[async_trait]
impl ArchiveStore for SqlStore {
    async fn upsert_counts(&self, records: &[CounterRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        // A failed transaction rolls back in full, so replaying it is safe
        retry("sql_upsert_counts", &RetryConfig::query(), || async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            for chunk in records.chunks(self.upsert_chunk) {
                let sql = self.upsert_sql(chunk.len());
                let mut query = sqlx::query(&sql);
                for record in chunk {
                    query = query
                        .bind(record.key.user_id.as_str())
                        .bind(record.guild_id.as_str())
                        .bind(record.key.channel_id.as_str())
                        .bind(format_date(record.key.date))
                        .bind(record.count as i64);
                }
                query
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }

            tx.commit()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(records.len())
        })
        .await
    }

    async fn delete_guild(&self, guild_id: &str) -> Result<u64, StorageError> {
        retry("sql_delete_guild", &RetryConfig::query(), || async {
            let result = sqlx::query("DELETE FROM message_counts WHERE guild_id = ?")
                .bind(guild_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete_location(&self, guild_id: &str, channel_id: &str) -> Result<u64, StorageError> {
        retry("sql_delete_location", &RetryConfig::query(), || async {
            let result = sqlx::query("DELETE FROM message_counts WHERE guild_id = ? AND channel_id = ?")
                .bind(guild_id)
                .bind(channel_id)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn user_totals(&self, guild_id: &str) -> Result<Vec<UserTotal>, StorageError> {
        self.fetch_totals("sql_user_totals", guild_id, &LeaderboardFilter::default(), None)
            .await
    }

    async fn filtered_page(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UserTotal>, StorageError> {
        self.fetch_totals("sql_filtered_page", guild_id, filter, Some((offset, limit)))
            .await
    }

    async fn filtered_user_count(&self, guild_id: &str, filter: &LeaderboardFilter) -> Result<u64, StorageError> {
        let (where_sql, binds) = where_clause(guild_id, filter);
        let sql = format!(
            "SELECT COUNT(DISTINCT user_id) AS users FROM message_counts WHERE {}",
            where_sql
        );

        retry("sql_filtered_user_count", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind.as_str());
            }
            let row = query
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let users: i64 = row
                .try_get("users")
                .map_err(|e| StorageError::Decode(e.to_string()))?;
            Ok(users.max(0) as u64)
        })
        .await
    }

    async fn filtered_rank(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        user_id: &str,
    ) -> Result<Option<u64>, StorageError> {
        let (where_sql, binds) = where_clause(guild_id, filter);
        let rank_expr = if self.is_sqlite {
            "RANK() OVER (ORDER BY SUM(count) DESC)"
        } else {
            "CAST(RANK() OVER (ORDER BY SUM(count) DESC) AS SIGNED)"
        };
        let sql = format!(
            "WITH ranked AS (\
                SELECT user_id, {} AS rnk FROM message_counts WHERE {} GROUP BY user_id\
             ) SELECT rnk FROM ranked WHERE user_id = ?",
            rank_expr, where_sql
        );

        retry("sql_filtered_rank", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind.as_str());
            }
            let row = query
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            match row {
                Some(row) => {
                    let rank: i64 = row
                        .try_get("rnk")
                        .map_err(|e| StorageError::Decode(e.to_string()))?;
                    Ok(Some(rank.max(1) as u64))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn count_for(&self, guild_id: &str, key: &CounterKey) -> Result<u64, StorageError> {
        let date = format_date(key.date);

        retry("sql_count_for", &RetryConfig::query(), || async {
            let row = sqlx::query(
                "SELECT count FROM message_counts WHERE user_id = ? AND guild_id = ? AND channel_id = ? AND message_date = ?",
            )
            .bind(key.user_id.as_str())
            .bind(guild_id)
            .bind(key.channel_id.as_str())
            .bind(date.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            match row {
                Some(row) => {
                    let count: i64 = row
                        .try_get("count")
                        .map_err(|e| StorageError::Decode(e.to_string()))?;
                    Ok(count.max(0) as u64)
                }
                None => Ok(0),
            }
        })
        .await
    }

    async fn load_sync_status(&self, guild_id: &str) -> Result<Option<SyncStatus>, StorageError> {
        retry("sql_load_sync_status", &RetryConfig::query(), || async {
            let row = sqlx::query(
                "SELECT mode, phase, last_checkpoint, last_known_message_id, last_known_message_at, updated_at \
                 FROM sync_status WHERE guild_id = ?",
            )
            .bind(guild_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            let Some(row) = row else {
                return Ok(None);
            };

            let mode = get_opt_text(&row, "mode")
                .map(|m| m.parse().map_err(StorageError::Decode))
                .transpose()?;
            let phase: SyncPhase = get_text(&row, "phase")?
                .parse()
                .map_err(StorageError::Decode)?;
            let anchor_at: Option<i64> = row.try_get("last_known_message_at").ok().flatten();
            let anchor = match (get_opt_text(&row, "last_known_message_id"), anchor_at) {
                (Some(id), Some(at)) => Some(MessageAnchor::new(id, millis_to_utc(at))),
                _ => None,
            };
            let updated_at: i64 = row
                .try_get("updated_at")
                .map_err(|e| StorageError::Decode(e.to_string()))?;

            Ok(Some(SyncStatus {
                guild_id: guild_id.to_string(),
                mode,
                phase,
                last_checkpoint: get_opt_text(&row, "last_checkpoint"),
                anchor,
                updated_at: millis_to_utc(updated_at),
            }))
        })
        .await
    }

    async fn save_sync_status(&self, status: &SyncStatus) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO sync_status (guild_id, mode, phase, last_checkpoint, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(guild_id) DO UPDATE SET \
                mode = excluded.mode, \
                phase = excluded.phase, \
                last_checkpoint = excluded.last_checkpoint, \
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO sync_status (guild_id, mode, phase, last_checkpoint, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                mode = VALUES(mode), \
                phase = VALUES(phase), \
                last_checkpoint = VALUES(last_checkpoint), \
                updated_at = VALUES(updated_at)"
        };

        retry("sql_save_sync_status", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(status.guild_id.as_str())
                .bind(status.mode.map(|m| m.as_str()))
                .bind(status.phase.as_str())
                .bind(status.last_checkpoint.as_deref())
                .bind(status.updated_at.timestamp_millis())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn advance_anchor(&self, guild_id: &str, anchor: &MessageAnchor) -> Result<(), StorageError> {
        let ensure_row = if self.is_sqlite {
            "INSERT INTO sync_status (guild_id, phase, updated_at) VALUES (?, 'idle', ?) ON CONFLICT(guild_id) DO NOTHING"
        } else {
            "INSERT IGNORE INTO sync_status (guild_id, phase, updated_at) VALUES (?, 'idle', ?)"
        };
        // same order as `cmp_ids`: shorter id first, then byte order
        let advance = "UPDATE sync_status SET last_known_message_id = ?, last_known_message_at = ? \
                       WHERE guild_id = ? AND (\
                           last_known_message_id IS NULL \
                           OR LENGTH(last_known_message_id) < ? \
                           OR (LENGTH(last_known_message_id) = ? AND last_known_message_id < ?))";
        let at = anchor.created_at.timestamp_millis();
        let id_len = anchor.message_id.len() as i64;
        let now = Utc::now().timestamp_millis();

        retry("sql_advance_anchor", &RetryConfig::query(), || async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            sqlx::query(ensure_row)
                .bind(guild_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            sqlx::query(advance)
                .bind(anchor.message_id.as_str())
                .bind(at)
                .bind(guild_id)
                .bind(id_len)
                .bind(id_len)
                .bind(anchor.message_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            tx.commit()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::parse_date;
    use crate::sync::types::SyncMode;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        // Use local temp/ folder (gitignored) instead of system temp
        let dir = PathBuf::from("temp");
        let _ = std::fs::create_dir_all(&dir);
        dir.join(format!("sql_test_{}.db", name))
    }

    /// Clean up SQLite database and its WAL files
    fn cleanup_db(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    async fn open(name: &str) -> (SqlStore, PathBuf) {
        let db_path = temp_db_path(name);
        cleanup_db(&db_path);
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        (SqlStore::new(&url).await.unwrap(), db_path)
    }

    fn record(user: &str, channel: &str, date: &str, count: u64) -> CounterRecord {
        CounterRecord::new("g1", CounterKey::new(user, channel, parse_date(date).unwrap()), count)
    }

    #[tokio::test]
    async fn test_upsert_adds_to_existing_rows() {
        let (store, path) = open("upsert_adds").await;

        store.upsert_counts(&[record("u1", "c1", "2024-01-01", 3), record("u2", "c1", "2024-01-01", 1)]).await.unwrap();
        store.upsert_counts(&[record("u1", "c1", "2024-01-01", 2)]).await.unwrap();

        let key = CounterKey::new("u1", "c1", parse_date("2024-01-01").unwrap());
        assert_eq!(store.count_for("g1", &key).await.unwrap(), 5);

        let totals = store.user_totals("g1").await.unwrap();
        assert_eq!(totals, vec![UserTotal::new("u1", 5), UserTotal::new("u2", 1)]);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_upsert_spans_multiple_chunks() {
        let (store, path) = open("upsert_chunks").await;
        let store = store.with_upsert_chunk(7);

        let records: Vec<CounterRecord> = (0..50)
            .map(|i| record(&format!("u{}", i), "c1", "2024-01-01", 1))
            .collect();
        assert_eq!(store.upsert_counts(&records).await.unwrap(), 50);
        assert_eq!(store.user_totals("g1").await.unwrap().len(), 50);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_filtered_page_count_and_rank() {
        let (store, path) = open("filtered").await;
        store.upsert_counts(&[
            record("u1", "c1", "2024-01-01", 3),
            record("u1", "c2", "2024-01-02", 4),
            record("u2", "c1", "2024-01-01", 5),
            record("u3", "c1", "2024-01-01", 5),
        ]).await.unwrap();

        let ch1 = LeaderboardFilter { channel_id: Some("c1".into()), date: None };
        let page = store.filtered_page("g1", &ch1, 0, 2).await.unwrap();
        assert_eq!(page, vec![UserTotal::new("u2", 5), UserTotal::new("u3", 5)]);
        let page2 = store.filtered_page("g1", &ch1, 2, 2).await.unwrap();
        assert_eq!(page2, vec![UserTotal::new("u1", 3)]);
        assert_eq!(store.filtered_user_count("g1", &ch1).await.unwrap(), 3);

        assert_eq!(store.filtered_rank("g1", &ch1, "u3").await.unwrap(), Some(1));
        assert_eq!(store.filtered_rank("g1", &ch1, "u1").await.unwrap(), Some(3));

        let day2 = LeaderboardFilter { channel_id: None, date: Some(parse_date("2024-01-02").unwrap()) };
        assert_eq!(store.filtered_rank("g1", &day2, "u1").await.unwrap(), Some(1));
        assert_eq!(store.filtered_rank("g1", &day2, "u2").await.unwrap(), None);

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_delete_location_and_guild() {
        let (store, path) = open("deletes").await;
        store.upsert_counts(&[
            record("u1", "c1", "2024-01-01", 1),
            record("u1", "c2", "2024-01-01", 1),
            record("u2", "c2", "2024-01-01", 1),
        ]).await.unwrap();

        assert_eq!(store.delete_location("g1", "c2").await.unwrap(), 2);
        assert_eq!(store.delete_guild("g1").await.unwrap(), 1);
        assert!(store.user_totals("g1").await.unwrap().is_empty());

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_sync_status_round_trip_and_anchor() {
        let (store, path) = open("status").await;
        assert!(store.load_sync_status("g1").await.unwrap().is_none());

        let mut status = SyncStatus::new("g1");
        status.begin(SyncMode::Incremental);
        status.checkpoint("300");
        store.save_sync_status(&status).await.unwrap();

        let t = millis_to_utc(1_700_000_000_000);
        store.advance_anchor("g1", &MessageAnchor::new("1000", t)).await.unwrap();
        // older id at the same millisecond does not win
        store.advance_anchor("g1", &MessageAnchor::new("999", t)).await.unwrap();

        let loaded = store.load_sync_status("g1").await.unwrap().unwrap();
        assert_eq!(loaded.mode, Some(SyncMode::Incremental));
        assert_eq!(loaded.phase, SyncPhase::InProgress);
        assert_eq!(loaded.last_checkpoint.as_deref(), Some("300"));
        assert_eq!(loaded.anchor, Some(MessageAnchor::new("1000", t)));

        // saving status must not clobber the anchor
        status.complete();
        store.save_sync_status(&status).await.unwrap();
        let loaded = store.load_sync_status("g1").await.unwrap().unwrap();
        assert_eq!(loaded.phase, SyncPhase::Completed);
        assert!(loaded.last_checkpoint.is_none());
        assert_eq!(loaded.anchor.unwrap().message_id, "1000");

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_anchor_order_is_by_id_alone() {
        let (store, path) = open("anchor_order").await;
        let early = millis_to_utc(1_700_000_000_000);
        let late = millis_to_utc(1_700_000_900_000);

        store.advance_anchor("g1", &MessageAnchor::new("5000", early)).await.unwrap();
        // a later timestamp on an older id (clock skew) does not win
        store.advance_anchor("g1", &MessageAnchor::new("4999", late)).await.unwrap();
        assert_eq!(
            store.load_sync_status("g1").await.unwrap().unwrap().anchor,
            Some(MessageAnchor::new("5000", early))
        );

        // a newer id wins even with an earlier timestamp, as in memory
        let newer = MessageAnchor::new("10000", early - chrono::Duration::seconds(1));
        assert!(newer.is_newer_than(&MessageAnchor::new("5000", early)));
        store.advance_anchor("g1", &newer).await.unwrap();
        assert_eq!(store.load_sync_status("g1").await.unwrap().unwrap().anchor, Some(newer));

        cleanup_db(&path);
    }

    #[tokio::test]
    async fn test_advance_anchor_creates_row() {
        let (store, path) = open("anchor_row").await;
        let t = millis_to_utc(1_700_000_000_000);
        store.advance_anchor("g9", &MessageAnchor::new("42", t)).await.unwrap();

        let loaded = store.load_sync_status("g9").await.unwrap().unwrap();
        assert_eq!(loaded.phase, SyncPhase::Idle);
        assert!(loaded.mode.is_none());
        assert_eq!(loaded.anchor.unwrap().message_id, "42");

        cleanup_db(&path);
    }
}
