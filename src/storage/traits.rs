// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

use crate::activity::{CounterKey, CounterRecord, LeaderboardFilter};
use crate::sync::status::SyncStatus;
use crate::sync::types::MessageAnchor;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Stored data could not be decoded: {0}")]
    Decode(String),
}

/// A user's summed count over some slice of the counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTotal {
    pub user_id: String,
    pub total: u64,
}

impl UserTotal {
    pub fn new(user_id: impl Into<String>, total: u64) -> Self {
        Self { user_id: user_id.into(), total }
    }
}

/// Fast shared cache (Redis in production).
///
/// Keys passed in are unprefixed; a backend configured with a namespace
/// prefix applies it internally and strips it from keys it returns.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// HINCRBY. Returns the new field value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError>;

    /// HGETALL without modifying the hash.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError>;

    /// Read every field and delete the hash as one atomic step.
    /// Increments arriving after the call land in a fresh hash.
    async fn hash_take_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError>;

    /// Keys starting with `prefix` (literal match, no glob semantics).
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// ZINCRBY. Returns the new score.
    async fn zset_incr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StorageError>;

    /// ZREVRANGE WITHSCORES over inclusive ranks `start..=stop`.
    async fn zset_rev_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<(String, f64)>, StorageError>;

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError>;

    /// Members with a score strictly greater than `score`.
    async fn zset_count_above(&self, key: &str, score: f64) -> Result<u64, StorageError>;

    async fn zset_card(&self, key: &str) -> Result<u64, StorageError>;

    /// Replace the whole set atomically; readers see the old or the new set.
    async fn zset_replace(&self, key: &str, entries: &[(String, f64)]) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StorageError>;

    /// SET NX EX. Returns false when the key already exists.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Delete `key` only if its value equals `expected`. Returns whether it was deleted.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StorageError>;

    /// INCR on a counter key with no expiry. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

/// Durable counter store (MySQL/SQLite in production).
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Add every record's count to its row, creating missing rows.
    /// All records commit in one transaction or none do.
    async fn upsert_counts(&self, records: &[CounterRecord]) -> Result<usize, StorageError>;

    /// Remove every counter row of a guild. Returns rows deleted.
    async fn delete_guild(&self, guild_id: &str) -> Result<u64, StorageError>;

    /// Remove every counter row of one location in a guild. Returns rows deleted.
    async fn delete_location(&self, guild_id: &str, channel_id: &str) -> Result<u64, StorageError>;

    /// Lifetime total per user, highest first.
    async fn user_totals(&self, guild_id: &str) -> Result<Vec<UserTotal>, StorageError>;

    /// One page of per-user totals under `filter`, ordered by total desc then user id.
    async fn filtered_page(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UserTotal>, StorageError>;

    /// Distinct users with at least one row under `filter`.
    async fn filtered_user_count(&self, guild_id: &str, filter: &LeaderboardFilter) -> Result<u64, StorageError>;

    /// Competition rank of `user_id` under `filter`, or None when the user has no rows.
    async fn filtered_rank(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        user_id: &str,
    ) -> Result<Option<u64>, StorageError>;

    /// Stored count of one counter (0 when absent).
    async fn count_for(&self, guild_id: &str, key: &CounterKey) -> Result<u64, StorageError>;

    async fn load_sync_status(&self, guild_id: &str) -> Result<Option<SyncStatus>, StorageError>;

    /// Persist mode, phase, checkpoint and timestamp. The stored anchor is left untouched.
    async fn save_sync_status(&self, status: &SyncStatus) -> Result<(), StorageError>;

    /// Move the guild's anchor forward to `anchor` if it is newer than the
    /// stored one (creating the status row if needed). Never moves it back.
    async fn advance_anchor(&self, guild_id: &str, anchor: &MessageAnchor) -> Result<(), StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}
