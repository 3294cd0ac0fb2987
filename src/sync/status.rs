// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable per-guild sync record.
//!
//! The anchor is advanced separately from the rest of the record (see
//! [`ArchiveStore::advance_anchor`](crate::storage::traits::ArchiveStore::advance_anchor))
//! so a status save from a long-running sync can never move it backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{MessageAnchor, SyncMode, SyncPhase};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub guild_id: String,
    /// Mode of the most recent run; `None` before the first run.
    pub mode: Option<SyncMode>,
    pub phase: SyncPhase,
    /// Last location fully rebuilt by an unfinished incremental sync.
    pub last_checkpoint: Option<String>,
    pub anchor: Option<MessageAnchor>,
    pub updated_at: DateTime<Utc>,
}

impl SyncStatus {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            mode: None,
            phase: SyncPhase::Idle,
            last_checkpoint: None,
            anchor: None,
            updated_at: Utc::now(),
        }
    }

    /// A status left `InProgress` while nobody holds the lock belongs to a
    /// run that died without recording its outcome.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.phase == SyncPhase::InProgress
    }

    pub fn begin(&mut self, mode: SyncMode) {
        self.mode = Some(mode);
        self.phase = SyncPhase::InProgress;
        if mode == SyncMode::Full {
            // a full rebuild supersedes any half-done incremental pass
            self.last_checkpoint = None;
        }
        self.touch();
    }

    /// Mode of a full or incremental run that failed or died, leaving the
    /// store partly rebuilt. Cleared only when a rebuilding run completes.
    #[must_use]
    pub fn unfinished_rebuild(&self) -> Option<SyncMode> {
        match (self.phase, self.mode) {
            (SyncPhase::Failed | SyncPhase::InProgress, Some(mode @ (SyncMode::Full | SyncMode::Incremental))) => {
                Some(mode)
            }
            _ => None,
        }
    }

    pub fn checkpoint(&mut self, location_id: &str) {
        self.last_checkpoint = Some(location_id.to_string());
        self.touch();
    }

    /// Only a completed rebuild clears the checkpoint.
    pub fn complete(&mut self) {
        self.phase = SyncPhase::Completed;
        if matches!(self.mode, Some(SyncMode::Full | SyncMode::Incremental)) {
            self.last_checkpoint = None;
        }
        self.touch();
    }

    /// Keeps the checkpoint so an incremental rerun resumes.
    pub fn fail(&mut self) {
        self.phase = SyncPhase::Failed;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
