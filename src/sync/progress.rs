// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operator progress notices.
//!
//! One notice is posted to the initiator when a run starts and edited in
//! place afterwards. Notices are best-effort: a failed send or edit is
//! logged and never affects the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use super::types::{SyncMode, SyncReport};
use crate::platform::{NoticeHandle, PlatformClient};

const BAR_CELLS: usize = 20;

/// `██████░░░░░░░░░░░░░░` for `done / total`, 20 cells.
#[must_use]
pub fn render_bar(done: usize, total: usize) -> String {
    let filled = (percent(done, total) as usize * BAR_CELLS + 50) / 100;
    let filled = filled.min(BAR_CELLS);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_CELLS - filled))
}

#[must_use]
pub fn percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100 + total / 2) / total) as u32
}

/// `3m 07s` style elapsed time.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m {:02}s", secs / 60, secs % 60)
}

pub struct ProgressReporter {
    platform: Arc<dyn PlatformClient>,
    recipient: Option<String>,
    handle: Option<NoticeHandle>,
    mode: SyncMode,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(platform: Arc<dyn PlatformClient>, recipient: Option<String>, mode: SyncMode) -> Self {
        Self {
            platform,
            recipient,
            handle: None,
            mode,
            started: Instant::now(),
        }
    }

    pub async fn started(&mut self, guild_id: &str) {
        let text = format!("🚀 {} sync started for guild {guild_id}", self.label());
        self.post(&text).await;
    }

    pub async fn location_progress(&mut self, done: usize, total: usize, current: Option<&str>) {
        let mut text = format!(
            "🔄 {} sync in progress ({}%)\n{}\nLocations: {done} / {total}\nElapsed: {}",
            self.label(),
            percent(done, total),
            render_bar(done, total),
            format_elapsed(self.started.elapsed()),
        );
        if let Some(location) = current {
            text.push_str(&format!("\nScanning: {location}"));
        }
        self.post(&text).await;
    }

    pub async fn note(&mut self, text: &str) {
        self.post(text).await;
    }

    pub async fn finished(&mut self, report: &SyncReport) {
        let text = format!(
            "✅ {} sync complete\nLocations: {} processed, {} skipped\nMessages counted: {}\nTotal time: {}",
            self.label(),
            report.locations_processed,
            report.locations_skipped,
            report.messages_counted,
            format_elapsed(report.elapsed),
        );
        self.post(&text).await;
    }

    pub async fn failed(&mut self, reason: &str) {
        let text = format!(
            "❌ {} sync failed after {}: {reason}\nCheck the service logs for details.",
            self.label(),
            format_elapsed(self.started.elapsed()),
        );
        self.post(&text).await;
    }

    fn label(&self) -> &'static str {
        match self.mode {
            SyncMode::Full => "Full",
            SyncMode::Incremental => "Incremental",
            SyncMode::CatchUp => "Catch-up",
        }
    }

    async fn post(&mut self, content: &str) {
        let Some(recipient) = self.recipient.as_deref() else {
            return;
        };
        let result = if let Some(handle) = self.handle.as_ref() {
            self.platform.edit_notice(handle, content).await
        } else {
            self.platform
                .send_notice(recipient, content)
                .await
                .map(|handle| self.handle = Some(handle))
        };
        if let Err(e) = result {
            warn!(recipient = %recipient, error = %e, "Failed to deliver progress notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::InMemoryPlatform;

    #[test]
    fn test_bar_and_percent() {
        assert_eq!(render_bar(0, 10), "░".repeat(20));
        assert_eq!(render_bar(10, 10), "█".repeat(20));
        assert_eq!(render_bar(3, 10), format!("{}{}", "█".repeat(6), "░".repeat(14)));
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(0, 0), 100);
        assert_eq!(render_bar(0, 0).chars().count(), 20);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(187)), "3m 07s");
        assert_eq!(format_elapsed(Duration::from_millis(900)), "0m 00s");
    }

    #[tokio::test]
    async fn test_single_notice_edited_in_place() {
        let platform = Arc::new(InMemoryPlatform::new());
        let mut progress = ProgressReporter::new(platform.clone(), Some("admin".into()), SyncMode::Full);
        progress.started("g").await;
        progress.location_progress(1, 2, None).await;
        progress.failed("boom").await;

        let notices = platform.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].revisions.len(), 3);
        assert!(notices[0].latest().contains("boom"));
    }

    #[tokio::test]
    async fn test_silent_without_recipient() {
        let platform = Arc::new(InMemoryPlatform::new());
        let mut progress = ProgressReporter::new(platform.clone(), None, SyncMode::CatchUp);
        progress.started("g").await;
        assert!(platform.notices().is_empty());
    }
}
