// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catch-up: count messages posted after the anchor, typically while the
//! service was offline.
//!
//! Each page is written as soon as it is tallied. The anchor only moves once
//! every location is done, so a run that dies midway counts the written
//! pages again on the next run.

use tokio::time::sleep;
use tracing::{debug, warn};

use super::aggregate::Aggregate;
use super::pager::Walk;
use super::progress::ProgressReporter;
use super::types::{MessageAnchor, SyncError, SyncRequest};
use super::{ScanOutcome, SyncEngine};
use crate::platform::PlatformError;

impl SyncEngine {
    pub(super) async fn run_catch_up(
        &self,
        request: &SyncRequest,
        anchor: &MessageAnchor,
        progress: &mut ProgressReporter,
    ) -> Result<ScanOutcome, SyncError> {
        let guild_id = request.guild_id.as_str();
        self.buffer.flush_guild(guild_id).await?;

        let locations = self.sorted_locations(guild_id).await?;
        let total = locations.len();
        let mut outcome = ScanOutcome {
            locations_total: total,
            ..Default::default()
        };
        progress
            .note(&format!("✅ Anchor found, scanning after message {}", anchor.message_id))
            .await;

        let mut pager = self.pager(guild_id);
        for (index, location) in locations.iter().enumerate() {
            if index > 0 {
                sleep(self.config.catch_up_location_delay()).await;
            }
            progress.location_progress(index, total, Some(&location.name)).await;

            let mut tally = match self.live_since {
                Some(since) => Aggregate::with_cutoff(since),
                None => Aggregate::new(),
            };
            let mut walk = Walk::forward_after(anchor.message_id.clone());
            let mut readable = true;

            loop {
                let page = match pager.next_page(&location.id, &mut walk).await {
                    Ok(Some(page)) => page,
                    Ok(None) => break,
                    Err(PlatformError::Inaccessible(reason)) => {
                        warn!(location_id = %location.id, reason = %reason, "Skipping unreadable location");
                        readable = false;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };

                // the live path has counted everything from here on
                let mut reached_live = false;
                for message in &page {
                    if tally.admits(message) {
                        tally.observe(message);
                    } else {
                        reached_live = true;
                    }
                }
                let records = tally.drain_records(guild_id);
                if !records.is_empty() {
                    outcome.records_written += self.archive.upsert_counts(&records).await?;
                }
                if reached_live {
                    break;
                }
            }

            debug!(location_id = %location.id, messages = tally.messages(), "Location caught up");
            outcome.messages_counted += tally.messages();
            outcome.observe_newest(tally.newest());
            if readable {
                outcome.locations_processed += 1;
            } else {
                outcome.locations_skipped += 1;
            }
        }

        progress.location_progress(total, total, None).await;
        Ok(outcome)
    }
}
