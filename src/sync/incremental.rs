// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resumable sync: rebuild one location at a time, checkpointing after each.
//!
//! A run that dies between locations resumes at the next unprocessed one.
//! A run that dies inside a location rebuilds that location from scratch,
//! since its rows are deleted again before the rescan.

use tracing::info;

use super::progress::ProgressReporter;
use super::status::SyncStatus;
use super::types::{SyncError, SyncRequest};
use super::{drain_location, ClearScope, ScanOutcome, SyncEngine};
use crate::platform::{cmp_ids, Location};

/// Index of the first location ordered after `checkpoint`.
fn resume_index(locations: &[Location], checkpoint: Option<&str>) -> usize {
    match checkpoint {
        Some(cp) => locations
            .iter()
            .position(|l| cmp_ids(&l.id, cp).is_gt())
            .unwrap_or(locations.len()),
        None => 0,
    }
}

impl SyncEngine {
    pub(super) async fn run_incremental(
        &self,
        request: &SyncRequest,
        status: &mut SyncStatus,
        progress: &mut ProgressReporter,
    ) -> Result<ScanOutcome, SyncError> {
        let guild_id = request.guild_id.as_str();
        let locations = self.sorted_locations(guild_id).await?;
        let total = locations.len();
        let start = resume_index(&locations, status.last_checkpoint.as_deref());
        let mut outcome = ScanOutcome {
            locations_total: total,
            ..Default::default()
        };

        if start > 0 {
            info!(
                checkpoint = ?status.last_checkpoint,
                remaining = total - start,
                "Resuming incremental sync"
            );
            let next = locations.get(start).map_or("nothing left", |l| l.name.as_str());
            progress
                .note(&format!("ℹ️ Resuming an interrupted sync at {next}"))
                .await;
        }

        let mut pager = self.pager(guild_id);
        for (index, location) in locations.iter().enumerate().skip(start) {
            progress.location_progress(index, total, Some(&location.name)).await;

            let cutoff = self
                .clear_for_rebuild(guild_id, ClearScope::Location(&location.id))
                .await?;
            match drain_location(&mut pager, &location.id, cutoff).await? {
                Some(tally) => {
                    outcome.messages_counted += tally.messages();
                    outcome.observe_newest(tally.newest());
                    let records = tally.into_records(guild_id);
                    outcome.records_written += self.archive.upsert_counts(&records).await?;
                    outcome.locations_processed += 1;
                }
                None => outcome.locations_skipped += 1,
            }

            status.checkpoint(&location.id);
            self.archive.save_sync_status(status).await?;
        }

        progress.location_progress(total, total, None).await;
        Ok(outcome)
    }
}
