// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends with the same observable semantics as Redis and SQL.
//!
//! Used by the unit and consistency tests, and by embedders that run a single
//! node without external services.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::{Duration, Instant};

use super::traits::{ArchiveStore, CacheStore, StorageError, UserTotal};
use crate::activity::{CounterKey, CounterRecord, LeaderboardFilter};
use crate::sync::status::SyncStatus;
use crate::sync::types::MessageAnchor;

struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Expiring {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-memory stand-in for the Redis cache.
pub struct InMemoryCache {
    hashes: DashMap<String, HashMap<String, i64>>,
    zsets: DashMap<String, HashMap<String, f64>>,
    strings: DashMap<String, Expiring>,
    counters: DashMap<String, i64>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hashes: DashMap::new(),
            zsets: DashMap::new(),
            strings: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Whether a live key of any type exists.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
            || self.zsets.contains_key(key)
            || self.strings.get(key).is_some_and(|e| e.is_live())
            || self.counters.contains_key(key)
    }

    /// Drop everything (simulates a cache flush / restart).
    pub fn clear(&self) {
        self.hashes.clear();
        self.zsets.clear();
        self.strings.clear();
        self.counters.clear();
    }

    fn sorted_desc(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        // ZREVRANGE: score desc, ties in reverse lexicographic member order
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        entries
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let value = hash.entry(field.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), *v)).collect())
            .unwrap_or_default())
    }

    async fn hash_take_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        Ok(self
            .hashes
            .remove(key)
            .map(|(_, h)| h.into_iter().collect())
            .unwrap_or_default())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .hashes
            .iter()
            .map(|e| e.key().clone())
            .chain(self.zsets.iter().map(|e| e.key().clone()))
            .chain(self.strings.iter().filter(|e| e.is_live()).map(|e| e.key().clone()))
            .chain(self.counters.iter().map(|e| e.key().clone()))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn zset_incr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StorageError> {
        let mut set = self.zsets.entry(key.to_string()).or_default();
        let score = set.entry(member.to_string()).or_insert(0.0);
        *score += delta;
        Ok(*score)
    }

    async fn zset_rev_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<(String, f64)>, StorageError> {
        let Some(set) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        if stop < start {
            return Ok(Vec::new());
        }
        Ok(Self::sorted_desc(&set)
            .into_iter()
            .skip(start)
            .take(stop - start + 1)
            .collect())
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        Ok(self.zsets.get(key).and_then(|s| s.get(member).copied()))
    }

    async fn zset_count_above(&self, key: &str, score: f64) -> Result<u64, StorageError> {
        Ok(self
            .zsets
            .get(key)
            .map(|s| s.values().filter(|v| **v > score).count() as u64)
            .unwrap_or(0))
    }

    async fn zset_card(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.zsets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn zset_replace(&self, key: &str, entries: &[(String, f64)]) -> Result<(), StorageError> {
        if entries.is_empty() {
            self.zsets.remove(key);
        } else {
            self.zsets.insert(key.to_string(), entries.iter().cloned().collect());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .strings
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone())
            .or_else(|| self.counters.get(key).map(|v| v.to_string())))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StorageError> {
        self.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| Expiring {
            value: String::new(),
            expires_at: Instant::now(),
        });
        if entry.is_live() {
            return Ok(false);
        }
        entry.value = value.to_string();
        entry.expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.hashes.remove(key);
        self.zsets.remove(key);
        self.strings.remove(key);
        self.counters.remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        Ok(self
            .strings
            .remove_if(key, |_, e| e.is_live() && e.value == expected)
            .is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let mut value = self.counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct RowKey {
    guild_id: String,
    user_id: String,
    channel_id: String,
    date: NaiveDate,
}

/// In-memory stand-in for the SQL counter store.
///
/// A single write lock around the row map gives each upsert batch the same
/// all-or-nothing visibility as a SQL transaction.
pub struct InMemoryArchive {
    rows: RwLock<HashMap<RowKey, u64>>,
    statuses: DashMap<String, SyncStatus>,
}

impl InMemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            statuses: DashMap::new(),
        }
    }

    /// Every counter row of a guild, sorted by key.
    #[must_use]
    pub fn rows(&self, guild_id: &str) -> Vec<CounterRecord> {
        let rows = self.rows.read();
        let mut out: Vec<CounterRecord> = rows
            .iter()
            .filter(|(k, _)| k.guild_id == guild_id)
            .map(|(k, count)| {
                CounterRecord::new(
                    guild_id,
                    CounterKey::new(k.user_id.clone(), k.channel_id.clone(), k.date),
                    *count,
                )
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn filtered_totals(&self, guild_id: &str, filter: &LeaderboardFilter) -> Vec<UserTotal> {
        let rows = self.rows.read();
        let mut totals: HashMap<&str, u64> = HashMap::new();
        for (key, count) in rows.iter() {
            if key.guild_id != guild_id {
                continue;
            }
            if filter.channel_id.as_deref().is_some_and(|c| c != key.channel_id) {
                continue;
            }
            if filter.date.is_some_and(|d| d != key.date) {
                continue;
            }
            *totals.entry(key.user_id.as_str()).or_insert(0) += count;
        }
        let mut out: Vec<UserTotal> = totals
            .into_iter()
            .map(|(user, total)| UserTotal::new(user, total))
            .collect();
        out.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.user_id.cmp(&b.user_id)));
        out
    }
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchive {
    async fn upsert_counts(&self, records: &[CounterRecord]) -> Result<usize, StorageError> {
        let mut rows = self.rows.write();
        for record in records {
            let key = RowKey {
                guild_id: record.guild_id.clone(),
                user_id: record.key.user_id.clone(),
                channel_id: record.key.channel_id.clone(),
                date: record.key.date,
            };
            *rows.entry(key).or_insert(0) += record.count;
        }
        Ok(records.len())
    }

    async fn delete_guild(&self, guild_id: &str) -> Result<u64, StorageError> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|k, _| k.guild_id != guild_id);
        Ok((before - rows.len()) as u64)
    }

    async fn delete_location(&self, guild_id: &str, channel_id: &str) -> Result<u64, StorageError> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|k, _| !(k.guild_id == guild_id && k.channel_id == channel_id));
        Ok((before - rows.len()) as u64)
    }

    async fn user_totals(&self, guild_id: &str) -> Result<Vec<UserTotal>, StorageError> {
        Ok(self.filtered_totals(guild_id, &LeaderboardFilter::default()))
    }

    async fn filtered_page(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UserTotal>, StorageError> {
        Ok(self
            .filtered_totals(guild_id, filter)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn filtered_user_count(&self, guild_id: &str, filter: &LeaderboardFilter) -> Result<u64, StorageError> {
        Ok(self.filtered_totals(guild_id, filter).len() as u64)
    }

    async fn filtered_rank(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        user_id: &str,
    ) -> Result<Option<u64>, StorageError> {
        let totals = self.filtered_totals(guild_id, filter);
        let Some(mine) = totals.iter().find(|t| t.user_id == user_id).map(|t| t.total) else {
            return Ok(None);
        };
        Ok(Some(1 + totals.iter().filter(|t| t.total > mine).count() as u64))
    }

    async fn count_for(&self, guild_id: &str, key: &CounterKey) -> Result<u64, StorageError> {
        let row = RowKey {
            guild_id: guild_id.to_string(),
            user_id: key.user_id.clone(),
            channel_id: key.channel_id.clone(),
            date: key.date,
        };
        Ok(self.rows.read().get(&row).copied().unwrap_or(0))
    }

    async fn load_sync_status(&self, guild_id: &str) -> Result<Option<SyncStatus>, StorageError> {
        Ok(self.statuses.get(guild_id).map(|s| s.value().clone()))
    }

    async fn save_sync_status(&self, status: &SyncStatus) -> Result<(), StorageError> {
        let mut stored = self
            .statuses
            .entry(status.guild_id.clone())
            .or_insert_with(|| SyncStatus::new(status.guild_id.clone()));
        let anchor = stored.anchor.take();
        *stored = status.clone();
        stored.anchor = anchor;
        Ok(())
    }

    async fn advance_anchor(&self, guild_id: &str, anchor: &MessageAnchor) -> Result<(), StorageError> {
        let mut stored = self
            .statuses
            .entry(guild_id.to_string())
            .or_insert_with(|| SyncStatus::new(guild_id));
        MessageAnchor::advance(&mut stored.anchor, anchor.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
