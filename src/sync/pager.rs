// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rate-limited history paging.
//!
//! ```text
//!   backward: Latest ─► Before(oldest of page) ─► ... ─► short/empty page
//!   forward:  After(anchor) ─► After(newest of page) ─► ... ─► short/empty page
//! ```
//!
//! Consecutive fetches of one pager are spaced by at least the configured
//! delay, and never less than one second. Transient errors are retried at
//! the same pace.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::{TallyConfig, MIN_PAGE_FETCH_DELAY};
use crate::metrics;
use crate::platform::{cmp_ids, Cursor, HistoryQuery, PlatformClient, PlatformError, PlatformMessage};
use crate::resilience::retry::{retry_when, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerSettings {
    pub page_limit: u32,
    pub delay: Duration,
    pub attempts: usize,
}

impl PagerSettings {
    pub fn from_config(config: &TallyConfig) -> Self {
        Self {
            page_limit: config.history_page_limit.max(1),
            delay: config.page_fetch_delay(),
            attempts: config.fetch_max_attempts.max(1),
        }
    }
}

impl Default for PagerSettings {
    fn default() -> Self {
        Self::from_config(&TallyConfig::default())
    }
}

/// Position of one walk through a location's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Walk {
    backward: bool,
    cursor: Cursor,
    done: bool,
}

impl Walk {
    /// Newest to oldest, from the latest message.
    #[must_use]
    pub fn backward() -> Self {
        Self {
            backward: true,
            cursor: Cursor::Latest,
            done: false,
        }
    }

    /// Oldest to newest, strictly after `message_id`.
    #[must_use]
    pub fn forward_after(message_id: impl Into<String>) -> Self {
        Self {
            backward: false,
            cursor: Cursor::After(message_id.into()),
            done: false,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn advance(&mut self, page: &[PlatformMessage], limit: u32) {
        let edge = if self.backward {
            page.iter().min_by(|a, b| cmp_ids(&a.id, &b.id))
        } else {
            page.iter().max_by(|a, b| cmp_ids(&a.id, &b.id))
        };
        match edge {
            Some(m) => {
                self.cursor = if self.backward {
                    Cursor::Before(m.id.clone())
                } else {
                    Cursor::After(m.id.clone())
                };
                self.done = page.len() < limit as usize;
            }
            None => self.done = true,
        }
    }
}

pub struct HistoryPager {
    platform: Arc<dyn PlatformClient>,
    guild_id: String,
    settings: PagerSettings,
    last_fetch: Option<Instant>,
    fetches: u64,
}

impl HistoryPager {
    pub fn new(platform: Arc<dyn PlatformClient>, guild_id: impl Into<String>, settings: PagerSettings) -> Self {
        Self {
            platform,
            guild_id: guild_id.into(),
            settings,
            last_fetch: None,
            fetches: 0,
        }
    }

    /// Fetch the next page of `walk`, or `None` once the walk is finished.
    /// Pages come back in platform order; callers must not rely on it.
    pub async fn next_page(
        &mut self,
        location_id: &str,
        walk: &mut Walk,
    ) -> Result<Option<Vec<PlatformMessage>>, PlatformError> {
        if walk.done {
            return Ok(None);
        }
        let page = self.fetch(location_id, &walk.cursor).await?;
        walk.advance(&page, self.settings.page_limit);
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }

    /// Pages fetched so far, retries included.
    #[must_use]
    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    async fn throttle(&mut self) {
        let delay = self.settings.delay.max(MIN_PAGE_FETCH_DELAY);
        if let Some(last) = self.last_fetch {
            sleep_until(last + delay).await;
        }
        self.last_fetch = Some(Instant::now());
    }

    async fn fetch(&mut self, location_id: &str, cursor: &Cursor) -> Result<Vec<PlatformMessage>, PlatformError> {
        self.throttle().await;

        let query = HistoryQuery {
            limit: self.settings.page_limit,
            cursor: cursor.clone(),
        };
        let delay = self.settings.delay.max(MIN_PAGE_FETCH_DELAY);
        let config = RetryConfig::paging(delay, self.settings.attempts);
        let platform = &self.platform;
        let guild_id = self.guild_id.as_str();
        let mut attempts = 0u64;

        let result = retry_when("fetch_messages", &config, PlatformError::is_transient, || {
            attempts += 1;
            platform.fetch_messages(guild_id, location_id, &query)
        })
        .await;

        self.fetches += attempts;
        // retries already waited out the delay; restart the clock from the last attempt
        if attempts > 1 {
            self.last_fetch = Some(Instant::now());
        }

        match &result {
            Ok(page) => {
                metrics::record_page_fetch("success");
                debug!(location_id = %location_id, cursor = ?cursor, messages = page.len(), "Fetched history page");
            }
            Err(PlatformError::Inaccessible(reason)) => {
                metrics::record_page_fetch("inaccessible");
                warn!(location_id = %location_id, reason = %reason, "Location not readable");
            }
            Err(e) => {
                metrics::record_page_fetch("error");
                warn!(location_id = %location_id, error = %e, attempts, "History fetch failed");
            }
        }
        result
    }
}
