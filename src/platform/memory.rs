// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic in-process platform with snowflake ids, fault injection and
//! a fetch log for rate-limit assertions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    cmp_ids, Cursor, HistoryQuery, Location, NoticeHandle, PlatformClient, PlatformError,
    PlatformMessage,
};

/// 2015-01-01T00:00:00Z, the snowflake epoch.
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;
const SEQUENCE_MASK: u64 = (1 << 22) - 1;

#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub location_id: String,
    pub cursor: Cursor,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub handle: NoticeHandle,
    /// Every content the notice has had, oldest first.
    pub revisions: Vec<String>,
}

impl Notice {
    #[must_use]
    pub fn latest(&self) -> &str {
        self.revisions.last().map(String::as_str).unwrap_or("")
    }
}

#[derive(Default)]
pub struct InMemoryPlatform {
    locations: DashMap<String, Vec<Location>>,
    /// (guild, location) → messages sorted by id
    history: DashMap<(String, String), Vec<PlatformMessage>>,
    one_shot_faults: DashMap<String, VecDeque<PlatformError>>,
    broken: DashMap<String, PlatformError>,
    fetch_log: Mutex<Vec<FetchRecord>>,
    notices: Mutex<Vec<Notice>>,
    sequence: AtomicU64,
}

impl InMemoryPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_location(&self, guild_id: &str, location_id: &str, name: &str) {
        self.locations.entry(guild_id.to_string()).or_default().push(Location {
            id: location_id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn remove_location(&self, guild_id: &str, location_id: &str) {
        if let Some(mut locs) = self.locations.get_mut(guild_id) {
            locs.retain(|l| l.id != location_id);
        }
        self.history.remove(&(guild_id.to_string(), location_id.to_string()));
    }

    /// Append a message and return its id. Ids follow `created_at`.
    pub fn post(
        &self,
        guild_id: &str,
        location_id: &str,
        author_id: &str,
        author_is_bot: bool,
        created_at: DateTime<Utc>,
    ) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) & SEQUENCE_MASK;
        let millis = (created_at.timestamp_millis() - SNOWFLAKE_EPOCH_MS).max(0) as u64;
        let id = ((millis << 22) | seq).to_string();

        let message = PlatformMessage {
            id: id.clone(),
            channel_id: location_id.to_string(),
            author_id: author_id.to_string(),
            author_is_bot,
            created_at,
        };
        let mut messages = self
            .history
            .entry((guild_id.to_string(), location_id.to_string()))
            .or_default();
        let pos = messages
            .binary_search_by(|m| cmp_ids(&m.id, &id))
            .unwrap_or_else(|p| p);
        messages.insert(pos, message);
        id
    }

    /// Fail the next fetch of `location_id` with `error`. Queued faults fire in order.
    pub fn push_fault(&self, location_id: &str, error: PlatformError) {
        self.one_shot_faults
            .entry(location_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every fetch of `location_id` with `error` until [`Self::repair`].
    pub fn break_location(&self, location_id: &str, error: PlatformError) {
        self.broken.insert(location_id.to_string(), error);
    }

    pub fn repair(&self, location_id: &str) {
        self.broken.remove(location_id);
    }

    #[must_use]
    pub fn fetch_log(&self) -> Vec<FetchRecord> {
        self.fetch_log.lock().clone()
    }

    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetch_log.lock().len()
    }

    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    fn take_fault(&self, location_id: &str) -> Option<PlatformError> {
        if let Some(err) = self.broken.get(location_id) {
            return Some(err.clone());
        }
        self.one_shot_faults
            .get_mut(location_id)
            .and_then(|mut q| q.pop_front())
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn locations(&self, guild_id: &str) -> Result<Vec<Location>, PlatformError> {
        Ok(self.locations.get(guild_id).map(|l| l.value().clone()).unwrap_or_default())
    }

    async fn fetch_messages(
        &self,
        guild_id: &str,
        location_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        self.fetch_log.lock().push(FetchRecord {
            location_id: location_id.to_string(),
            cursor: query.cursor.clone(),
            at: Instant::now(),
        });

        if let Some(err) = self.take_fault(location_id) {
            return Err(err);
        }

        let key = (guild_id.to_string(), location_id.to_string());
        let Some(messages) = self.history.get(&key) else {
            let known = self
                .locations
                .get(guild_id)
                .is_some_and(|l| l.iter().any(|loc| loc.id == location_id));
            return if known {
                Ok(Vec::new())
            } else {
                Err(PlatformError::Inaccessible(format!("unknown location {location_id}")))
            };
        };

        let limit = query.limit as usize;
        let mut page: Vec<PlatformMessage> = match &query.cursor {
            Cursor::Latest => messages.iter().rev().take(limit).cloned().collect(),
            Cursor::Before(id) => messages
                .iter()
                .rev()
                .filter(|m| cmp_ids(&m.id, id).is_lt())
                .take(limit)
                .cloned()
                .collect(),
            Cursor::After(id) => messages
                .iter()
                .filter(|m| cmp_ids(&m.id, id).is_gt())
                .take(limit)
                .cloned()
                .collect(),
        };
        // newest first, like the real gateway
        page.sort_by(|a, b| cmp_ids(&b.id, &a.id));
        Ok(page)
    }

    async fn send_notice(&self, recipient: &str, content: &str) -> Result<NoticeHandle, PlatformError> {
        let mut notices = self.notices.lock();
        let handle = NoticeHandle {
            recipient: recipient.to_string(),
            message_id: format!("notice-{}", notices.len() + 1),
        };
        notices.push(Notice {
            handle: handle.clone(),
            revisions: vec![content.to_string()],
        });
        Ok(handle)
    }

    async fn edit_notice(&self, handle: &NoticeHandle, content: &str) -> Result<(), PlatformError> {
        let mut notices = self.notices.lock();
        let notice = notices
            .iter_mut()
            .find(|n| n.handle == *handle)
            .ok_or_else(|| PlatformError::Inaccessible(format!("notice {} not found", handle.message_id)))?;
        notice.revisions.push(content.to_string());
        Ok(())
    }
}
