// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chat platform seam.
//!
//! The engine only needs four things from the platform: the message-bearing
//! locations of a guild, pages of a location's history, and a way to post and
//! edit a progress notice for whoever started a sync.

pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Rate limit, timeout, 5xx. Worth retrying after the page delay.
    #[error("transient platform error: {0}")]
    Transient(String),
    /// Location vanished or we lost permission to read it.
    #[error("location inaccessible: {0}")]
    Inaccessible(String),
    #[error("platform error: {0}")]
    Fatal(String),
}

impl PlatformError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A channel or thread that carries messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_is_bot: bool,
    pub created_at: DateTime<Utc>,
}

/// Where a history page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// The newest messages.
    Latest,
    /// Messages strictly older than the given id.
    Before(String),
    /// Messages strictly newer than the given id.
    After(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: u32,
    pub cursor: Cursor,
}

/// Handle to a posted notice so it can be edited in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeHandle {
    pub recipient: String,
    pub message_id: String,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn locations(&self, guild_id: &str) -> Result<Vec<Location>, PlatformError>;

    /// One page of at most `query.limit` messages. Order within the page is
    /// not guaranteed; an empty page means the end of history in that direction.
    async fn fetch_messages(
        &self,
        guild_id: &str,
        location_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<PlatformMessage>, PlatformError>;

    async fn send_notice(&self, recipient: &str, content: &str) -> Result<NoticeHandle, PlatformError>;

    async fn edit_notice(&self, handle: &NoticeHandle, content: &str) -> Result<(), PlatformError>;
}

/// Order two snowflake ids numerically.
///
/// Snowflakes are decimal strings of varying length, so `"99" < "100"`.
///
/// Shorter ids sort first, equal lengths compare bytewise. For snowflakes
/// this is numeric order, and the SQL store's anchor update expresses the
/// same rule with `LENGTH` and string comparison.
#[must_use]
pub fn cmp_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
