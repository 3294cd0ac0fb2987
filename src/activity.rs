// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Activity data model: counter keys, counter records, live events and
//! leaderboard filters.
//!
//! A counter is identified by `(guild, user, channel, day)`. Inside a guild's
//! write-behind hash the guild is implicit, so the field is encoded as:
//!
//! ```text
//! {user_id}:{channel_id}:{YYYY-MM-DD}
//! ```
//!
//! Platform identifiers are numeric snowflakes and never contain `:`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("expected 3 ':'-separated parts, got {0}")]
    PartCount(usize),
    #[error("empty {0} in counter key")]
    Empty(&'static str),
    #[error("invalid date '{0}'")]
    Date(String),
}

/// Guild-relative counter key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey {
    pub user_id: String,
    pub channel_id: String,
    pub date: NaiveDate,
}

impl CounterKey {
    pub fn new(user_id: impl Into<String>, channel_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            date,
        }
    }

    /// Encode as a write-behind hash field.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.channel_id, self.date.format(DATE_FORMAT))
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for CounterKey {
    type Err = KeyError;

    fn from_str(field: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = field.split(':').collect();
        let [user, channel, date] = parts.as_slice() else {
            return Err(KeyError::PartCount(parts.len()));
        };
        if user.is_empty() {
            return Err(KeyError::Empty("user"));
        }
        if channel.is_empty() {
            return Err(KeyError::Empty("channel"));
        }
        let date = parse_date(date)?;
        Ok(Self::new(*user, *channel, date))
    }
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(s: &str) -> Result<NaiveDate, KeyError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| KeyError::Date(s.to_string()))
}

#[must_use]
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// One row of the counter store (or one delta to add to it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub guild_id: String,
    pub key: CounterKey,
    pub count: u64,
}

impl CounterRecord {
    pub fn new(guild_id: impl Into<String>, key: CounterKey, count: u64) -> Self {
        Self {
            guild_id: guild_id.into(),
            key,
            count,
        }
    }
}

/// A message observed on the live gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// `None` for direct messages.
    pub guild_id: Option<String>,
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_is_bot: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageEvent {
    /// UTC calendar day the message counts towards.
    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.created_at.date_naive()
    }
}

/// Optional narrowing of a leaderboard to one channel and/or one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaderboardFilter {
    pub channel_id: Option<String>,
    pub date: Option<NaiveDate>,
}

impl LeaderboardFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channel_id.is_none() && self.date.is_none()
    }

    /// Suffix distinguishing snapshot keys of differently filtered pages.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut sig = String::new();
        if let Some(ref channel) = self.channel_id {
            sig.push_str("_ch:");
            sig.push_str(channel);
        }
        if let Some(date) = self.date {
            sig.push_str("_date:");
            sig.push_str(&format_date(date));
        }
        sig
    }
}
