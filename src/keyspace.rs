// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache key layout. Every key is namespaced by guild; the optional global
//! prefix is applied by the cache backend, not here.
//!
//! | Key | Type | Owner |
//! |-----|------|-------|
//! | `dirty_counts:{guild}` | hash | write-behind buffer |
//! | `leaderboard:{guild}` | sorted set | ranking cache |
//! | `leaderboard:page-gen:{guild}` | counter | page snapshots |
//! | `leaderboard:page:{guild}:v{gen}:{page}{filter}` | string + TTL | page snapshots |
//! | `sync-lock:{guild}` | string + TTL | sync lock |

pub const DIRTY_PREFIX: &str = "dirty_counts:";

#[must_use]
pub fn dirty_counts(guild_id: &str) -> String {
    format!("{DIRTY_PREFIX}{guild_id}")
}

/// Inverse of [`dirty_counts`].
#[must_use]
pub fn guild_of_dirty_key(key: &str) -> Option<&str> {
    key.strip_prefix(DIRTY_PREFIX).filter(|g| !g.is_empty())
}

#[must_use]
pub fn ranking(guild_id: &str) -> String {
    format!("leaderboard:{guild_id}")
}

/// Counter bumped whenever the guild's snapshots go stale.
#[must_use]
pub fn page_snapshot_generation(guild_id: &str) -> String {
    format!("leaderboard:page-gen:{guild_id}")
}

#[must_use]
pub fn page_snapshot(guild_id: &str, generation: u64, page: u32, filter_signature: &str) -> String {
    format!("leaderboard:page:{guild_id}:v{generation}:{page}{filter_signature}")
}

#[must_use]
pub fn sync_lock(guild_id: &str) -> String {
    format!("sync-lock:{guild_id}")
}
