// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paged leaderboard queries.
//!
//! ```text
//!   unfiltered ──► RankingCache (ZREVRANGE / ZCARD / rank_of)
//!
//!   filtered ──► PageSnapshotCache ──hit──► snapshot rows
//!                      │ miss
//!                      ▼
//!                ArchiveStore (grouped sums) ──► store snapshot (TTL)
//!
//!   requester rank: always computed for the request, never cached
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::activity::LeaderboardFilter;
use crate::metrics::LatencyTimer;
use crate::ranking::{assign_ranks, RankedRow, RankingCache};
use crate::snapshot::{PageSnapshot, PageSnapshotCache};
use crate::storage::traits::{ArchiveStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardQuery {
    pub guild_id: String,
    pub requester_id: String,
    /// 1-based; values below 1 are treated as 1.
    pub page: u32,
    pub filter: LeaderboardFilter,
}

impl LeaderboardQuery {
    pub fn new(guild_id: impl Into<String>, requester_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            requester_id: requester_id.into(),
            page: 1,
            filter: LeaderboardFilter::default(),
        }
    }

    #[must_use]
    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: LeaderboardFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardPage {
    pub page: u32,
    /// At least 1, even for an empty leaderboard.
    pub total_pages: u32,
    pub total_users: u64,
    pub rows: Vec<RankedRow>,
    pub requester_rank: Option<u64>,
    pub requester_page: Option<u32>,
    /// Rows came from a page snapshot.
    pub from_snapshot: bool,
}

impl LeaderboardPage {
    #[must_use]
    pub fn has_previous(&self) -> bool {
        self.page > 1
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

pub struct Leaderboard {
    ranking: Arc<RankingCache>,
    snapshots: Arc<PageSnapshotCache>,
    archive: Arc<dyn ArchiveStore>,
    page_size: usize,
}

impl Leaderboard {
    pub fn new(
        ranking: Arc<RankingCache>,
        snapshots: Arc<PageSnapshotCache>,
        archive: Arc<dyn ArchiveStore>,
        page_size: usize,
    ) -> Self {
        Self {
            ranking,
            snapshots,
            archive,
            page_size: page_size.max(1),
        }
    }

    #[tracing::instrument(skip(self), fields(guild_id = %query.guild_id, page = query.page))]
    pub async fn page(&self, query: &LeaderboardQuery) -> Result<LeaderboardPage, StorageError> {
        let _timer = LatencyTimer::new("leaderboard", "page");
        let page = query.page.max(1);
        if query.filter.is_empty() {
            self.ranked_page(query, page).await
        } else {
            self.filtered_page(query, page).await
        }
    }

    async fn ranked_page(&self, query: &LeaderboardQuery, page: u32) -> Result<LeaderboardPage, StorageError> {
        let guild_id = &query.guild_id;
        let rows = self.ranking.top_page(guild_id, page, self.page_size).await?;
        let total_users = self.ranking.total_users(guild_id).await?;
        let requester_rank = self.ranking.rank_of(guild_id, &query.requester_id).await?;
        Ok(self.assemble(page, total_users, rows, requester_rank, false))
    }

    async fn filtered_page(&self, query: &LeaderboardQuery, page: u32) -> Result<LeaderboardPage, StorageError> {
        let guild_id = &query.guild_id;
        let filter = &query.filter;

        let generation = match self.snapshots.generation(guild_id).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!(guild_id = %guild_id, error = %e, "Snapshot generation unavailable, bypassing snapshots");
                None
            }
        };
        let cached = match generation {
            Some(generation) => match self.snapshots.get(guild_id, generation, page, filter).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(guild_id = %guild_id, error = %e, "Page snapshot lookup failed, reading store");
                    None
                }
            },
            None => None,
        };

        let (rows, total_users, from_snapshot) = match cached {
            Some(snapshot) => (snapshot.rows, snapshot.total_users, true),
            None => {
                let offset = (page as usize - 1) * self.page_size;
                let totals = self
                    .archive
                    .filtered_page(guild_id, filter, offset, self.page_size)
                    .await?;
                let total_users = self.archive.filtered_user_count(guild_id, filter).await?;
                let first_rank = match totals.first() {
                    Some(first) => self
                        .archive
                        .filtered_rank(guild_id, filter, &first.user_id)
                        .await?
                        .unwrap_or(offset as u64 + 1),
                    None => offset as u64 + 1,
                };
                let rows = assign_ranks(totals, offset as u64, first_rank);

                let snapshot = PageSnapshot {
                    page,
                    total_pages: self.total_pages(total_users),
                    total_users,
                    rows: rows.clone(),
                    created_at: Utc::now(),
                };
                if let Some(generation) = generation {
                    let ttl = self.snapshots.default_ttl();
                    if let Err(e) = self.snapshots.put(guild_id, generation, filter, &snapshot, ttl).await {
                        warn!(guild_id = %guild_id, error = %e, "Failed to store page snapshot");
                    }
                }
                (rows, total_users, false)
            }
        };

        let requester_rank = self
            .archive
            .filtered_rank(guild_id, filter, &query.requester_id)
            .await?;
        Ok(self.assemble(page, total_users, rows, requester_rank, from_snapshot))
    }

    fn assemble(
        &self,
        page: u32,
        total_users: u64,
        rows: Vec<RankedRow>,
        requester_rank: Option<u64>,
        from_snapshot: bool,
    ) -> LeaderboardPage {
        LeaderboardPage {
            page,
            total_pages: self.total_pages(total_users),
            total_users,
            rows,
            requester_rank,
            requester_page: requester_rank.map(|rank| self.page_of(rank)),
            from_snapshot,
        }
    }

    fn total_pages(&self, total_users: u64) -> u32 {
        let pages = total_users.div_ceil(self.page_size as u64).max(1);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }

    fn page_of(&self, rank: u64) -> u32 {
        u32::try_from(rank.div_ceil(self.page_size as u64).max(1)).unwrap_or(u32::MAX)
    }
}
