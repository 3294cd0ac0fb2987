// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory tally of scanned history, merged into the counter store in one go.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::types::MessageAnchor;
use crate::activity::{CounterKey, CounterRecord};
use crate::platform::PlatformMessage;

/// Per-key message counts built from history pages.
///
/// Messages created at or after `cutoff` are ignored: the live path owns
/// them. Merging is additive, so the order aggregates are combined in never
/// changes the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregate {
    counts: HashMap<CounterKey, u64>,
    messages: u64,
    newest: Option<MessageAnchor>,
    cutoff: Option<DateTime<Utc>>,
}

impl Aggregate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cutoff(cutoff: DateTime<Utc>) -> Self {
        Self {
            cutoff: Some(cutoff),
            ..Self::default()
        }
    }

    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        self.cutoff
    }

    /// Whether `message` falls before the cutoff.
    #[must_use]
    pub fn admits(&self, message: &PlatformMessage) -> bool {
        self.cutoff.is_none_or(|c| message.created_at < c)
    }

    /// Tally one message. Returns whether it was counted.
    pub fn observe(&mut self, message: &PlatformMessage) -> bool {
        if !self.admits(message) {
            return false;
        }
        // bots never count, but they still mark how far history was read
        MessageAnchor::advance(
            &mut self.newest,
            MessageAnchor::new(message.id.clone(), message.created_at),
        );
        if message.author_is_bot {
            return false;
        }
        let key = CounterKey::new(
            message.author_id.clone(),
            message.channel_id.clone(),
            message.created_at.date_naive(),
        );
        *self.counts.entry(key).or_insert(0) += 1;
        self.messages += 1;
        true
    }

    pub fn merge(&mut self, other: Aggregate) {
        for (key, count) in other.counts {
            *self.counts.entry(key).or_insert(0) += count;
        }
        self.messages += other.messages;
        if let Some(anchor) = other.newest {
            MessageAnchor::advance(&mut self.newest, anchor);
        }
    }

    /// Counted (non-bot) messages.
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Distinct counter keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Newest message seen, bots included.
    #[must_use]
    pub fn newest(&self) -> Option<&MessageAnchor> {
        self.newest.as_ref()
    }

    /// Move the counts out as records, keeping the message total and anchor.
    pub fn drain_records(&mut self, guild_id: &str) -> Vec<CounterRecord> {
        let mut records: Vec<CounterRecord> = self
            .counts
            .drain()
            .map(|(key, count)| CounterRecord::new(guild_id, key, count))
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn into_records(mut self, guild_id: &str) -> Vec<CounterRecord> {
        self.drain_records(guild_id)
    }
}
