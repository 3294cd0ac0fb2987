// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::{cmp_ids, PlatformError};
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Wipe the guild and recount all history with parallel workers.
    Full,
    /// Rebuild one location at a time, resumable from a checkpoint.
    Incremental,
    /// Count only messages newer than the stored anchor.
    CatchUp,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::CatchUp => "catch_up",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "catch_up" => Ok(Self::CatchUp),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

/// Lifecycle of the most recent sync of a guild.
///
/// ```text
/// Idle → InProgress → Completed
///            ↑     ↘ Failed
///            └──────────┘ (next run)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    InProgress,
    Completed,
    Failed,
}

impl SyncPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync phase '{other}'")),
        }
    }
}

/// The newest message known to be counted for a guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAnchor {
    pub message_id: String,
    pub created_at: DateTime<Utc>,
}

impl MessageAnchor {
    pub fn new(message_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            created_at,
        }
    }

    /// Whether `self` is strictly newer than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &MessageAnchor) -> bool {
        cmp_ids(&self.message_id, &other.message_id).is_gt()
    }

    /// Keep whichever of `current` and `candidate` is newer.
    pub fn advance(current: &mut Option<MessageAnchor>, candidate: MessageAnchor) {
        match current {
            Some(existing) if !candidate.is_newer_than(existing) => {}
            _ => *current = Some(candidate),
        }
    }
}

/// Parameters of one sync invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub guild_id: String,
    /// Who receives progress notices; `None` runs silently.
    pub initiator: Option<String>,
    /// Full-resync worker count override.
    pub parallelism: Option<usize>,
}

impl SyncRequest {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            initiator: None,
            parallelism: None,
        }
    }

    #[must_use]
    pub fn notify(mut self, recipient: impl Into<String>) -> Self {
        self.initiator = Some(recipient.into());
        self
    }

    #[must_use]
    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers.max(1));
        self
    }
}

/// What a completed sync did.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub guild_id: String,
    pub mode: SyncMode,
    pub locations_total: usize,
    pub locations_processed: usize,
    pub locations_skipped: usize,
    pub messages_counted: u64,
    pub records_written: usize,
    pub anchor: Option<MessageAnchor>,
    pub elapsed: Duration,
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Another run holds the guild's lock. Not a failure.
    #[error("a sync is already running for this guild (held by {holder})")]
    Busy { holder: String },
    #[error("no anchor recorded yet; run a full or incremental sync first")]
    NoAnchor,
    /// A full or incremental run left rows half rebuilt; catch-up would
    /// build on them.
    #[error("the last {mode} sync did not finish; rerun it before catching up")]
    RebuildPending { mode: SyncMode },
    #[error("storage error during sync: {0}")]
    Storage(#[from] StorageError),
    #[error("platform error during sync: {0}")]
    Platform(#[from] PlatformError),
    #[error("sync worker crashed: {0}")]
    WorkerCrashed(String),
}

impl SyncError {
    /// Metric label for the outcome.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Busy { .. } => "busy",
            Self::NoAnchor => "no_anchor",
            Self::RebuildPending { .. } => "rebuild_pending",
            _ => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_and_phase_round_trip_strings() {
        for mode in [SyncMode::Full, SyncMode::Incremental, SyncMode::CatchUp] {
            assert_eq!(mode.as_str().parse::<SyncMode>().unwrap(), mode);
        }
        for phase in [SyncPhase::Idle, SyncPhase::InProgress, SyncPhase::Completed, SyncPhase::Failed] {
            assert_eq!(phase.as_str().parse::<SyncPhase>().unwrap(), phase);
        }
        assert!("paused".parse::<SyncPhase>().is_err());
    }

    #[test]
    fn test_anchor_advance_keeps_newest() {
        let t = Utc::now();
        let mut anchor = None;
        MessageAnchor::advance(&mut anchor, MessageAnchor::new("200", t));
        MessageAnchor::advance(&mut anchor, MessageAnchor::new("99", t));
        assert_eq!(anchor.as_ref().unwrap().message_id, "200");
        MessageAnchor::advance(&mut anchor, MessageAnchor::new("1000", t));
        assert_eq!(anchor.unwrap().message_id, "1000");
    }

    #[test]
    fn test_request_builder() {
        let req = SyncRequest::new("g").notify("admin").with_parallelism(0);
        assert_eq!(req.initiator.as_deref(), Some("admin"));
        assert_eq!(req.parallelism, Some(1));
    }
}
