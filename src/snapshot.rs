// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Short-lived JSON snapshots of filtered leaderboard pages.
//!
//! Keyed by guild, generation, page and filter signature. Invalidating a
//! guild bumps its generation counter, which orphans every snapshot of the
//! previous generation until its TTL runs out. A live message therefore
//! costs one `INCR`, never a key scan.
//!
//! Readers take the generation before they query the store and write the
//! snapshot under that generation, so a page computed before an
//! invalidation is never served after it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::activity::LeaderboardFilter;
use crate::keyspace;
use crate::metrics;
use crate::ranking::RankedRow;
use crate::storage::traits::{CacheStore, StorageError};

/// The cacheable part of a filtered page. Requester rank is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub page: u32,
    pub total_pages: u32,
    pub total_users: u64,
    pub rows: Vec<RankedRow>,
    pub created_at: DateTime<Utc>,
}

pub struct PageSnapshotCache {
    cache: Arc<dyn CacheStore>,
    default_ttl: Duration,
}

impl PageSnapshotCache {
    pub fn new(cache: Arc<dyn CacheStore>, ttl_secs: u64) -> Self {
        Self {
            cache,
            default_ttl: Duration::from_secs(ttl_secs.max(1)),
        }
    }

    /// TTL configured for this cache (`page_cache_ttl_secs`).
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Current snapshot generation of the guild; 0 before the first
    /// invalidation.
    pub async fn generation(&self, guild_id: &str) -> Result<u64, StorageError> {
        let key = keyspace::page_snapshot_generation(guild_id);
        match self.cache.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| StorageError::Decode(format!("snapshot generation '{raw}': {e}"))),
        }
    }

    /// A snapshot that fails to decode is treated as a miss and dropped.
    pub async fn get(
        &self,
        guild_id: &str,
        generation: u64,
        page: u32,
        filter: &LeaderboardFilter,
    ) -> Result<Option<PageSnapshot>, StorageError> {
        let key = keyspace::page_snapshot(guild_id, generation, page, &filter.signature());
        let Some(raw) = self.cache.get(&key).await? else {
            metrics::record_snapshot(false);
            return Ok(None);
        };
        match serde_json::from_str::<PageSnapshot>(&raw) {
            Ok(snapshot) => {
                metrics::record_snapshot(true);
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable page snapshot");
                metrics::record_snapshot(false);
                self.cache.delete(&key).await?;
                Ok(None)
            }
        }
    }

    /// Store `snapshot` under `generation`, expiring after `ttl` (at least 1 s).
    pub async fn put(
        &self,
        guild_id: &str,
        generation: u64,
        filter: &LeaderboardFilter,
        snapshot: &PageSnapshot,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let key = keyspace::page_snapshot(guild_id, generation, snapshot.page, &filter.signature());
        let payload = serde_json::to_string(snapshot).map_err(|e| StorageError::Decode(e.to_string()))?;
        self.cache.set_ex(&key, &payload, ttl.as_secs().max(1)).await
    }

    /// Orphan every snapshot of the guild. Returns the new generation.
    pub async fn invalidate_guild(&self, guild_id: &str) -> Result<u64, StorageError> {
        let generation = self.cache.incr(&keyspace::page_snapshot_generation(guild_id)).await?;
        Ok(u64::try_from(generation).unwrap_or(0))
    }
}
