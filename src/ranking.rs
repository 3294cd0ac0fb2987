// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ranking cache: one sorted set per guild mapping user → all-time total.
//!
//! Advisory only. The counter store is the source of truth and a sync
//! rebuilds this set from it, so the set can be dropped at any time.
//!
//! A rebuild replaces the whole set, so a live increment landing between
//! the totals read and the replace would be lost. Live increments hold a
//! guild's [`LiveGuard`] and rebuilds its [`RebuildGuard`]; the two never
//! overlap within one process.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use crate::keyspace;
use crate::metrics;
use crate::storage::traits::{CacheStore, StorageError, UserTotal};

/// One leaderboard row with its competition rank ("1224" ranking).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankedRow {
    pub rank: u64,
    pub user_id: String,
    pub total: u64,
}

/// Assign competition ranks to rows already ordered by total descending.
///
/// `first_rank` is the rank of the first row; a later row shares its
/// predecessor's rank on a tie and otherwise ranks at its absolute position.
pub fn assign_ranks(rows: Vec<UserTotal>, offset: u64, first_rank: u64) -> Vec<RankedRow> {
    let mut ranked: Vec<RankedRow> = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        let rank = match ranked.last() {
            None => first_rank,
            Some(prev) if prev.total == row.total => prev.rank,
            Some(_) => offset + i as u64 + 1,
        };
        ranked.push(RankedRow {
            rank,
            user_id: row.user_id,
            total: row.total,
        });
    }
    ranked
}

/// Held by a live event while it updates the buffer and the ranking.
pub struct LiveGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

/// Held by a sync from the totals read until the set is replaced.
pub struct RebuildGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

pub struct RankingCache {
    cache: Arc<dyn CacheStore>,
    rebuilds: DashMap<String, Arc<RwLock<()>>>,
}

impl RankingCache {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self {
            cache,
            rebuilds: DashMap::new(),
        }
    }

    fn rebuild_lock(&self, guild_id: &str) -> Arc<RwLock<()>> {
        self.rebuilds.entry(guild_id.to_string()).or_default().clone()
    }

    /// Waits out a rebuild of the guild in progress.
    pub async fn live_guard(&self, guild_id: &str) -> LiveGuard {
        LiveGuard {
            _guard: self.rebuild_lock(guild_id).read_owned().await,
        }
    }

    /// Waits for in-flight live increments and blocks new ones.
    pub async fn lock_rebuild(&self, guild_id: &str) -> RebuildGuard {
        RebuildGuard {
            _guard: self.rebuild_lock(guild_id).write_owned().await,
        }
    }

    pub async fn increment(&self, guild_id: &str, user_id: &str, delta: u64) -> Result<f64, StorageError> {
        self.cache
            .zset_incr(&keyspace::ranking(guild_id), user_id, delta as f64)
            .await
    }

    /// Rows of a 1-based page, best first.
    pub async fn top_page(&self, guild_id: &str, page: u32, size: usize) -> Result<Vec<RankedRow>, StorageError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let key = keyspace::ranking(guild_id);
        let offset = (page.max(1) as usize - 1) * size;
        let entries = self.cache.zset_rev_range(&key, offset, offset + size - 1).await?;
        let Some((_, first_score)) = entries.first() else {
            return Ok(Vec::new());
        };
        let first_rank = self.cache.zset_count_above(&key, *first_score).await? + 1;

        let rows = entries
            .into_iter()
            .map(|(user_id, score)| UserTotal::new(user_id, score_to_total(score)))
            .collect();
        Ok(assign_ranks(rows, offset as u64, first_rank))
    }

    /// `1 + |users with a strictly greater total|`, or `None` if unranked.
    pub async fn rank_of(&self, guild_id: &str, user_id: &str) -> Result<Option<u64>, StorageError> {
        let key = keyspace::ranking(guild_id);
        let Some(score) = self.cache.zset_score(&key, user_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.cache.zset_count_above(&key, score).await? + 1))
    }

    pub async fn total_users(&self, guild_id: &str) -> Result<u64, StorageError> {
        self.cache.zset_card(&keyspace::ranking(guild_id)).await
    }

    /// Replace the guild's set with `totals`. Zero totals are left out.
    pub async fn rebuild(&self, guild_id: &str, totals: &[UserTotal]) -> Result<usize, StorageError> {
        let entries: Vec<(String, f64)> = totals
            .iter()
            .filter(|t| t.total > 0)
            .map(|t| (t.user_id.clone(), t.total as f64))
            .collect();
        self.cache.zset_replace(&keyspace::ranking(guild_id), &entries).await?;
        debug!(guild_id = %guild_id, users = entries.len(), "Ranking cache rebuilt");
        metrics::record_ranking_rebuild(entries.len());
        Ok(entries.len())
    }

    pub async fn clear(&self, guild_id: &str) -> Result<(), StorageError> {
        self.cache.delete(&keyspace::ranking(guild_id)).await
    }
}

fn score_to_total(score: f64) -> u64 {
    if score.is_finite() && score >= 0.0 {
        score.round() as u64
    } else {
        warn!(score, "Ignoring out-of-range ranking score");
        0
    }
}
