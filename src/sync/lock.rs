// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-guild mutual exclusion for sync runs.
//!
//! The lock is a cache key set with NX and a TTL. Its value is a JSON lease
//! naming the holder plus a random token; release deletes the key only if it
//! still carries our lease, so an expired-and-reacquired lock is never
//! released by the previous holder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::SyncError;
use crate::keyspace;
use crate::metrics;
use crate::storage::traits::{CacheStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub owner: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// A lock we hold. Must be handed back to [`SyncLock::release`].
#[derive(Debug)]
pub struct HeldLock {
    pub guild_id: String,
    pub lease: LockLease,
    encoded: String,
}

pub struct SyncLock {
    cache: Arc<dyn CacheStore>,
    ttl_secs: u64,
}

impl SyncLock {
    pub fn new(cache: Arc<dyn CacheStore>, ttl_secs: u64) -> Self {
        Self {
            cache,
            ttl_secs: ttl_secs.max(1),
        }
    }

    /// Take the guild's lock or report who holds it.
    pub async fn acquire(&self, guild_id: &str, owner: &str) -> Result<HeldLock, SyncError> {
        let lease = LockLease {
            owner: owner.to_string(),
            token: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&lease).map_err(|e| StorageError::Decode(e.to_string()))?;
        let key = keyspace::sync_lock(guild_id);

        if self.cache.set_nx_ex(&key, &encoded, self.ttl_secs).await? {
            metrics::record_lock(true);
            debug!(guild_id = %guild_id, owner = %owner, "Sync lock acquired");
            return Ok(HeldLock {
                guild_id: guild_id.to_string(),
                lease,
                encoded,
            });
        }

        metrics::record_lock(false);
        let holder = self
            .holder(guild_id)
            .await
            .ok()
            .flatten()
            .map(|l| l.owner)
            .unwrap_or_else(|| "unknown".to_string());
        Err(SyncError::Busy { holder })
    }

    /// Release a lock we hold. Returns `false` if it had already expired
    /// or been taken over.
    pub async fn release(&self, held: &HeldLock) -> Result<bool, StorageError> {
        let released = self
            .cache
            .delete_if_eq(&keyspace::sync_lock(&held.guild_id), &held.encoded)
            .await?;
        if !released {
            warn!(guild_id = %held.guild_id, owner = %held.lease.owner, "Sync lock was lost before release");
        }
        Ok(released)
    }

    /// Current holder, if any. An undecodable lease reads as no holder.
    pub async fn holder(&self, guild_id: &str) -> Result<Option<LockLease>, StorageError> {
        let raw = self.cache.get(&keyspace::sync_lock(guild_id)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }
}
