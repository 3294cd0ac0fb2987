// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind buffer.
//!
//! Live increments land in a per-guild cache hash (`dirty_counts:{guild}`)
//! and are moved into the counter store by a periodic flush:
//!
//! ```text
//! record_increment ──HINCRBY──► dirty_counts:{guild}
//!                                     │ flush: MULTI HGETALL + DEL
//!                                     ▼
//!                       decode fields → CounterRecords
//!                                     │ one additive upsert transaction
//!                                     ▼
//!                               message_counts
//! ```
//!
//! Draining is atomic, so an increment is either in the drained batch or in
//! the fresh hash, never both. A batch whose transaction fails has already
//! left the cache: those increments are lost and reported as such.
//!
//! Flushes are serialized by a gate. Sync runs hold the gate while they flush
//! and delete rows so a concurrent periodic flush cannot interleave.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::activity::{CounterKey, CounterRecord};
use crate::keyspace;
use crate::metrics;
use crate::storage::traits::{ArchiveStore, CacheStore, StorageError};

/// Proof that the caller holds the flush gate.
pub struct FlushGate<'a> {
    _guard: MutexGuard<'a, ()>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Guilds with a non-empty accumulator.
    pub guilds: usize,
    /// Counter rows upserted.
    pub records: usize,
    /// Increments committed to the counter store.
    pub increments: u64,
    /// Increments drained but not committed.
    pub lost_increments: u64,
    /// Hash fields that did not decode and were dropped.
    pub malformed: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.guilds += other.guilds;
        self.records += other.records;
        self.increments += other.increments;
        self.lost_increments += other.lost_increments;
        self.malformed += other.malformed;
    }
}

pub struct WriteBehindBuffer {
    cache: Arc<dyn CacheStore>,
    archive: Arc<dyn ArchiveStore>,
    gate: Mutex<()>,
}

impl WriteBehindBuffer {
    pub fn new(cache: Arc<dyn CacheStore>, archive: Arc<dyn ArchiveStore>) -> Self {
        Self {
            cache,
            archive,
            gate: Mutex::new(()),
        }
    }

    /// Add one to a counter. Never blocks on the counter store and never
    /// fails the caller; returns whether the increment was buffered.
    pub async fn record_increment(&self, guild_id: &str, key: &CounterKey) -> bool {
        match self
            .cache
            .hash_incr(&keyspace::dirty_counts(guild_id), &key.encode(), 1)
            .await
        {
            Ok(_) => {
                metrics::record_increment("buffer", "success");
                true
            }
            Err(e) => {
                warn!(guild_id = %guild_id, key = %key, error = %e, "Failed to buffer increment");
                metrics::record_increment("buffer", "error");
                false
            }
        }
    }

    /// Pending (not yet flushed) deltas of a guild, read without draining.
    pub async fn pending(&self, guild_id: &str) -> Result<Vec<CounterRecord>, StorageError> {
        let fields = self.cache.hash_get_all(&keyspace::dirty_counts(guild_id)).await?;
        let (records, _) = decode_fields(guild_id, fields);
        Ok(records)
    }

    /// Wait for any in-flight flush and block new ones until the gate is dropped.
    pub async fn lock_flushes(&self) -> FlushGate<'_> {
        FlushGate {
            _guard: self.gate.lock().await,
        }
    }

    /// Flush every dirty guild.
    ///
    /// Fails only when dirty guilds cannot be listed. Per-guild failures are
    /// logged and reflected in the report.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&self) -> Result<FlushReport, StorageError> {
        let gate = self.lock_flushes().await;
        let start = Instant::now();

        let keys = self.cache.keys_with_prefix(keyspace::DIRTY_PREFIX).await?;
        let guilds: Vec<&str> = keys.iter().filter_map(|k| keyspace::guild_of_dirty_key(k)).collect();
        metrics::set_dirty_guilds(guilds.len());

        let mut report = FlushReport::default();
        for guild_id in guilds {
            match self.flush_guild_held(&gate, guild_id).await {
                Ok(guild_report) => report.absorb(guild_report),
                Err(e) => {
                    // drain failed before anything left the cache; retried next cycle
                    warn!(guild_id = %guild_id, error = %e, "Failed to drain write-behind buffer");
                    metrics::record_error("buffer", "drain");
                }
            }
        }

        metrics::record_flush_duration(start.elapsed());
        if report.guilds > 0 {
            info!(
                guilds = report.guilds,
                records = report.records,
                increments = report.increments,
                lost = report.lost_increments,
                duration_ms = start.elapsed().as_millis() as u64,
                "Write-behind flush complete"
            );
        }
        Ok(report)
    }

    /// Flush a single guild.
    pub async fn flush_guild(&self, guild_id: &str) -> Result<FlushReport, StorageError> {
        let gate = self.lock_flushes().await;
        self.flush_guild_held(&gate, guild_id).await
    }

    /// Flush a single guild while the caller already holds the gate.
    ///
    /// Errors only if the drain itself fails (nothing lost). A failed
    /// upsert is a data-loss event and is reported, not returned.
    pub async fn flush_guild_held(&self, _gate: &FlushGate<'_>, guild_id: &str) -> Result<FlushReport, StorageError> {
        let fields = self.cache.hash_take_all(&keyspace::dirty_counts(guild_id)).await?;
        if fields.is_empty() {
            return Ok(FlushReport::default());
        }

        let (records, malformed) = decode_fields(guild_id, fields);
        let increments: u64 = records.iter().map(|r| r.count).sum();
        let mut report = FlushReport {
            guilds: 1,
            malformed,
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        match self.archive.upsert_counts(&records).await {
            Ok(written) => {
                debug!(guild_id = %guild_id, records = written, increments, "Flushed guild");
                metrics::record_flush(written, increments, true);
                report.records = written;
                report.increments = increments;
            }
            Err(e) => {
                error!(
                    guild_id = %guild_id,
                    records = records.len(),
                    increments,
                    error = %e,
                    "DATA LOSS: drained increments failed to commit and cannot be restored"
                );
                metrics::record_flush(records.len(), increments, false);
                metrics::record_data_loss(increments);
                report.lost_increments = increments;
            }
        }
        Ok(report)
    }
}

/// Decode hash fields into records, dropping malformed fields and
/// non-positive values. Returns the records and the malformed count.
fn decode_fields(guild_id: &str, fields: Vec<(String, i64)>) -> (Vec<CounterRecord>, usize) {
    let mut records = Vec::with_capacity(fields.len());
    let mut malformed = 0;
    for (field, value) in fields {
        match field.parse::<CounterKey>() {
            Ok(key) if value > 0 => records.push(CounterRecord::new(guild_id, key, value as u64)),
            Ok(_) => {}
            Err(e) => {
                warn!(guild_id = %guild_id, field = %field, error = %e, "Skipping malformed buffer field");
                malformed += 1;
            }
        }
    }
    if malformed > 0 {
        metrics::record_malformed_fields(malformed);
    }
    records.sort_by(|a, b| a.key.cmp(&b.key));
    (records, malformed)
}
