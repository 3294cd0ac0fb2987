// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! History synchronization.
//!
//! Three modes rebuild or top up a guild's counters from platform history:
//!
//! | Mode | Scope | Resumable | Parallel |
//! |------|-------|-----------|----------|
//! | [`SyncMode::Full`] | wipe guild, recount everything | no | worker pool |
//! | [`SyncMode::Incremental`] | one location at a time | checkpoint | no |
//! | [`SyncMode::CatchUp`] | messages after the anchor | no | no |
//!
//! Every run follows the same frame:
//!
//! ```text
//! acquire lock ──busy──► SyncError::Busy (no status change)
//!      │
//!      ▼
//! status = in_progress ─► mode body ─► rebuild ranking ─► drop snapshots
//!      │                      │                              │
//!      │                   error/panic                       ▼
//!      │                      ▼                  status = completed, anchor
//!      │               status = failed                       │
//!      └──────────────────────┴─────────► release lock ◄─────┘
//! ```
//!
//! Before a mode touches stored rows it holds the write-behind flush gate,
//! flushes the guild, deletes the rows it is about to rebuild and takes the
//! current time as a cutoff. Scans skip messages created at or after the
//! cutoff because the live path counts those.

pub mod aggregate;
mod catch_up;
mod full;
mod incremental;
pub mod lock;
pub mod pager;
pub mod progress;
pub mod status;
pub mod types;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::TallyConfig;
use crate::metrics;
use crate::platform::{cmp_ids, Location, PlatformClient, PlatformError};
use crate::ranking::RankingCache;
use crate::snapshot::PageSnapshotCache;
use crate::storage::traits::{ArchiveStore, CacheStore, UserTotal};
use crate::write_behind::WriteBehindBuffer;

use aggregate::Aggregate;
use lock::SyncLock;
use pager::{HistoryPager, PagerSettings, Walk};
use progress::ProgressReporter;
use status::SyncStatus;
pub use types::{MessageAnchor, SyncError, SyncMode, SyncPhase, SyncReport, SyncRequest};

/// What a mode body did, before the shared completion steps.
#[derive(Debug, Default)]
struct ScanOutcome {
    locations_total: usize,
    locations_processed: usize,
    locations_skipped: usize,
    messages_counted: u64,
    records_written: usize,
    newest: Option<MessageAnchor>,
}

impl ScanOutcome {
    fn observe_newest(&mut self, anchor: Option<&MessageAnchor>) {
        if let Some(anchor) = anchor {
            MessageAnchor::advance(&mut self.newest, anchor.clone());
        }
    }
}

/// Rows a mode clears before rebuilding them.
enum ClearScope<'a> {
    Guild,
    Location(&'a str),
}

pub struct SyncEngine {
    archive: Arc<dyn ArchiveStore>,
    platform: Arc<dyn PlatformClient>,
    buffer: Arc<WriteBehindBuffer>,
    ranking: Arc<RankingCache>,
    snapshots: Arc<PageSnapshotCache>,
    lock: SyncLock,
    config: TallyConfig,
    pager_settings: PagerSettings,
    /// When the live path started counting; catch-up leaves newer messages to it.
    live_since: Option<DateTime<Utc>>,
    active: AtomicUsize,
}

impl SyncEngine {
    pub fn new(
        archive: Arc<dyn ArchiveStore>,
        cache: Arc<dyn CacheStore>,
        platform: Arc<dyn PlatformClient>,
        buffer: Arc<WriteBehindBuffer>,
        ranking: Arc<RankingCache>,
        snapshots: Arc<PageSnapshotCache>,
        config: &TallyConfig,
    ) -> Self {
        Self {
            archive,
            platform,
            buffer,
            ranking,
            snapshots,
            lock: SyncLock::new(cache, config.sync_lock_ttl_secs),
            config: config.clone(),
            pager_settings: PagerSettings::from_config(config),
            live_since: None,
            active: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_live_since(mut self, since: DateTime<Utc>) -> Self {
        self.live_since = Some(since);
        self
    }

    /// Override paging settings (tests use a page limit smaller than 100).
    #[must_use]
    pub fn with_pager_settings(mut self, settings: PagerSettings) -> Self {
        self.pager_settings = settings;
        self
    }

    /// Wipe the guild and recount its whole history with parallel workers.
    pub async fn full_resync(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::Full, request).await
    }

    /// Rebuild location by location, resuming after the last checkpoint.
    pub async fn incremental_sync(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::Incremental, request).await
    }

    /// Count messages posted after the stored anchor.
    pub async fn catch_up(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::CatchUp, request).await
    }

    pub async fn status(&self, guild_id: &str) -> Result<Option<SyncStatus>, SyncError> {
        Ok(self.archive.load_sync_status(guild_id).await?)
    }

    /// Runs currently holding a lock in this process.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[tracing::instrument(skip_all, fields(guild_id = %request.guild_id, mode = %mode))]
    async fn run(&self, mode: SyncMode, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        let owner = request.initiator.as_deref().unwrap_or("system");
        let held = match self.lock.acquire(&request.guild_id, owner).await {
            Ok(held) => held,
            Err(e) => {
                if let SyncError::Busy { ref holder } = e {
                    info!(holder = %holder, "Sync already running, request rejected");
                }
                metrics::record_sync_run(mode.as_str(), e.status_label());
                return Err(e);
            }
        };
        metrics::set_active_syncs(self.active.fetch_add(1, Ordering::Relaxed) + 1);

        let result = match AssertUnwindSafe(self.execute(mode, request)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(reason = %reason, "Sync run panicked");
                self.mark_failed(&request.guild_id).await;
                metrics::record_sync_run(mode.as_str(), "error");
                Err(SyncError::WorkerCrashed(reason))
            }
        };

        if let Err(e) = self.lock.release(&held).await {
            // the TTL frees it eventually
            warn!(error = %e, "Failed to release sync lock");
        }
        metrics::set_active_syncs(self.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1));
        result
    }

    async fn execute(&self, mode: SyncMode, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let guild_id = request.guild_id.as_str();

        let mut status = self
            .archive
            .load_sync_status(guild_id)
            .await?
            .unwrap_or_else(|| SyncStatus::new(guild_id));
        if status.is_abandoned() {
            warn!(
                previous_mode = ?status.mode,
                checkpoint = ?status.last_checkpoint,
                "Previous sync never finished, treating it as failed"
            );
        }
        let anchor = status.anchor.clone();
        if mode == SyncMode::CatchUp {
            let refusal = match (status.unfinished_rebuild(), &anchor) {
                (Some(pending), _) => Some(SyncError::RebuildPending { mode: pending }),
                (None, None) => Some(SyncError::NoAnchor),
                (None, Some(_)) => None,
            };
            if let Some(e) = refusal {
                // status untouched: the unfinished run must still resume
                info!(reason = %e, "Catch-up refused");
                metrics::record_sync_run(mode.as_str(), e.status_label());
                return Err(e);
            }
        }

        status.begin(mode);
        self.archive.save_sync_status(&status).await?;

        let mut progress = ProgressReporter::new(self.platform.clone(), request.initiator.clone(), mode);
        progress.started(guild_id).await;

        let body = match mode {
            SyncMode::Full => self.run_full(request, &mut progress).await,
            SyncMode::Incremental => self.run_incremental(request, &mut status, &mut progress).await,
            SyncMode::CatchUp => match anchor {
                Some(ref anchor) => self.run_catch_up(request, anchor, &mut progress).await,
                None => Err(SyncError::NoAnchor),
            },
        };
        let outcome = match body {
            Ok(outcome) => self.complete(guild_id, &mut status, outcome).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                let report = SyncReport {
                    guild_id: guild_id.to_string(),
                    mode,
                    locations_total: outcome.locations_total,
                    locations_processed: outcome.locations_processed,
                    locations_skipped: outcome.locations_skipped,
                    messages_counted: outcome.messages_counted,
                    records_written: outcome.records_written,
                    anchor: outcome.newest.or(anchor),
                    elapsed: start.elapsed(),
                };
                progress.finished(&report).await;
                metrics::record_sync_run(mode.as_str(), "success");
                metrics::record_sync_duration(mode.as_str(), report.elapsed);
                metrics::record_sync_messages(mode.as_str(), report.messages_counted);
                info!(
                    locations = report.locations_processed,
                    skipped = report.locations_skipped,
                    messages = report.messages_counted,
                    records = report.records_written,
                    duration_ms = report.elapsed.as_millis() as u64,
                    "Sync completed"
                );
                Ok(report)
            }
            Err(e) => {
                status.fail();
                if let Err(save_err) = self.archive.save_sync_status(&status).await {
                    warn!(error = %save_err, "Failed to record sync failure");
                }
                progress.failed(&e.to_string()).await;
                metrics::record_sync_run(mode.as_str(), e.status_label());
                metrics::record_error("sync", mode.as_str());
                error!(error = %e, checkpoint = ?status.last_checkpoint, "Sync failed");
                Err(e)
            }
        }
    }

    /// Shared tail of every successful body.
    async fn complete(
        &self,
        guild_id: &str,
        status: &mut SyncStatus,
        outcome: ScanOutcome,
    ) -> Result<ScanOutcome, SyncError> {
        self.rebuild_ranking(guild_id).await?;
        if let Err(e) = self.snapshots.invalidate_guild(guild_id).await {
            warn!(error = %e, "Failed to drop page snapshots after sync");
        }
        if let Some(ref newest) = outcome.newest {
            self.archive.advance_anchor(guild_id, newest).await?;
        }
        status.complete();
        self.archive.save_sync_status(status).await?;
        Ok(outcome)
    }

    /// Replace the ranking with store totals plus unflushed deltas.
    ///
    /// Holds the flush gate so no batch is counted twice or missed between
    /// the two reads, and the guild's rebuild lock until the set is replaced
    /// so no live increment lands in between.
    async fn rebuild_ranking(&self, guild_id: &str) -> Result<(), SyncError> {
        let _rebuild = self.ranking.lock_rebuild(guild_id).await;
        let gate = self.buffer.lock_flushes().await;
        let stored = self.archive.user_totals(guild_id).await?;
        let pending = self.buffer.pending(guild_id).await?;
        drop(gate);

        let mut totals: HashMap<String, u64> = stored.into_iter().map(|t| (t.user_id, t.total)).collect();
        for record in pending {
            *totals.entry(record.key.user_id).or_insert(0) += record.count;
        }
        let totals: Vec<UserTotal> = totals.into_iter().map(|(user, total)| UserTotal::new(user, total)).collect();
        self.ranking.rebuild(guild_id, &totals).await?;
        Ok(())
    }

    /// Flush the guild, delete the rows in `scope`, and return the cutoff
    /// instant for the scan that rebuilds them.
    async fn clear_for_rebuild(&self, guild_id: &str, scope: ClearScope<'_>) -> Result<DateTime<Utc>, SyncError> {
        let gate = self.buffer.lock_flushes().await;
        let flushed = self.buffer.flush_guild_held(&gate, guild_id).await?;
        let deleted = match scope {
            ClearScope::Guild => self.archive.delete_guild(guild_id).await?,
            ClearScope::Location(location_id) => self.archive.delete_location(guild_id, location_id).await?,
        };
        let cutoff = Utc::now();
        drop(gate);
        debug!(
            flushed = flushed.increments,
            deleted,
            cutoff = %cutoff,
            "Cleared rows for rebuild"
        );
        Ok(cutoff)
    }

    /// Locations of the guild, deduplicated and in id order (oldest first).
    async fn sorted_locations(&self, guild_id: &str) -> Result<Vec<Location>, SyncError> {
        let mut locations = self.platform.locations(guild_id).await?;
        locations.sort_by(|a, b| cmp_ids(&a.id, &b.id));
        locations.dedup_by(|a, b| a.id == b.id);
        Ok(locations)
    }

    fn pager(&self, guild_id: &str) -> HistoryPager {
        HistoryPager::new(self.platform.clone(), guild_id, self.pager_settings)
    }

    async fn mark_failed(&self, guild_id: &str) {
        match self.archive.load_sync_status(guild_id).await {
            Ok(Some(mut status)) => {
                status.fail();
                if let Err(e) = self.archive.save_sync_status(&status).await {
                    warn!(error = %e, "Failed to record sync failure after panic");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load sync status after panic"),
        }
    }
}

/// Page backward through a location's whole history.
///
/// Returns `None` if the location cannot be read; its partial tally is
/// discarded.
async fn drain_location(
    pager: &mut HistoryPager,
    location_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<Option<Aggregate>, PlatformError> {
    let mut aggregate = Aggregate::with_cutoff(cutoff);
    let mut walk = Walk::backward();
    loop {
        match pager.next_page(location_id, &mut walk).await {
            Ok(Some(page)) => {
                for message in &page {
                    aggregate.observe(message);
                }
            }
            Ok(None) => return Ok(Some(aggregate)),
            Err(PlatformError::Inaccessible(reason)) => {
                warn!(location_id = %location_id, reason = %reason, "Skipping unreadable location");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
