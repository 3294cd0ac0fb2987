// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full resync: wipe the guild, fan the locations out to a worker pool,
//! merge the workers' tallies and write them in one transaction.
//!
//! ```text
//!             locations (sorted, deduplicated)
//!    ┌──────────────┬──────────────┬──────────────┐
//!    ▼              ▼              ▼              ▼
//! worker 0       worker 1       worker 2  ...  (contiguous chunks)
//!  pager+agg      pager+agg      pager+agg
//!    └──────────────┴───── JoinSet ┴──────────────┘
//!                          │ one WorkerReport each
//!                          ▼
//!                 merge ─► upsert (single transaction)
//! ```
//!
//! Workers share nothing and report once. The first error or panic aborts
//! the rest and the partial tallies are discarded.

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::aggregate::Aggregate;
use super::pager::HistoryPager;
use super::progress::ProgressReporter;
use super::types::{SyncError, SyncRequest};
use super::{drain_location, ClearScope, ScanOutcome, SyncEngine};
use crate::platform::{Location, PlatformError};

/// What one worker hands back to the coordinator.
#[derive(Debug)]
struct WorkerReport {
    worker: usize,
    processed: usize,
    skipped: usize,
    aggregate: Aggregate,
}

/// Split `total` items into at most `workers` contiguous chunks of
/// `ceil(total / workers)`.
fn chunk_size(total: usize, workers: usize) -> usize {
    total.div_ceil(workers.clamp(1, total.max(1))).max(1)
}

async fn scan_chunk(
    worker: usize,
    mut pager: HistoryPager,
    locations: Vec<Location>,
    cutoff: DateTime<Utc>,
) -> Result<WorkerReport, PlatformError> {
    let mut report = WorkerReport {
        worker,
        processed: 0,
        skipped: 0,
        aggregate: Aggregate::with_cutoff(cutoff),
    };
    for location in &locations {
        match drain_location(&mut pager, &location.id, cutoff).await? {
            Some(tally) => {
                report.aggregate.merge(tally);
                report.processed += 1;
            }
            None => report.skipped += 1,
        }
    }
    debug!(
        worker,
        locations = locations.len(),
        messages = report.aggregate.messages(),
        fetches = pager.fetches(),
        "Worker finished"
    );
    Ok(report)
}

impl SyncEngine {
    pub(super) async fn run_full(
        &self,
        request: &SyncRequest,
        progress: &mut ProgressReporter,
    ) -> Result<ScanOutcome, SyncError> {
        let guild_id = request.guild_id.as_str();
        let locations = self.sorted_locations(guild_id).await?;
        let cutoff = self.clear_for_rebuild(guild_id, ClearScope::Guild).await?;

        let total = locations.len();
        let mut outcome = ScanOutcome {
            locations_total: total,
            ..Default::default()
        };
        if total == 0 {
            return Ok(outcome);
        }

        let wanted = request
            .parallelism
            .unwrap_or_else(|| self.config.worker_count(total));
        let size = chunk_size(total, wanted);
        info!(locations = total, workers = total.div_ceil(size), "Starting full resync");

        let mut workers = JoinSet::new();
        for (index, chunk) in locations.chunks(size).enumerate() {
            workers.spawn(scan_chunk(index, self.pager(guild_id), chunk.to_vec(), cutoff));
        }

        let mut merged = Aggregate::with_cutoff(cutoff);
        while let Some(joined) = workers.join_next().await {
            let report = match joined {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    workers.abort_all();
                    return Err(e.into());
                }
                Err(join_err) => {
                    workers.abort_all();
                    let reason = if join_err.is_panic() {
                        "worker panicked".to_string()
                    } else {
                        join_err.to_string()
                    };
                    return Err(SyncError::WorkerCrashed(reason));
                }
            };
            outcome.locations_processed += report.processed;
            outcome.locations_skipped += report.skipped;
            debug!(worker = report.worker, "Merging worker report");
            merged.merge(report.aggregate);
            progress
                .location_progress(outcome.locations_processed + outcome.locations_skipped, total, None)
                .await;
        }

        outcome.messages_counted = merged.messages();
        outcome.observe_newest(merged.newest());
        let records = merged.into_records(guild_id);
        outcome.records_written = self.archive.upsert_counts(&records).await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size() {
        assert_eq!(chunk_size(10, 4), 3);
        assert_eq!(chunk_size(10, 1), 10);
        assert_eq!(chunk_size(3, 8), 1);
        assert_eq!(chunk_size(7, 0), 7);
        assert_eq!(chunk_size(0, 4), 1);
    }
}
