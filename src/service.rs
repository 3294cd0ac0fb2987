// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The service facade: live event path, periodic flush, leaderboard reads
//! and sync entry points behind one handle.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tally_engine::{TallyConfig, TallyService};
//! use tally_engine::platform::memory::InMemoryPlatform;
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TallyConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     sql_url: Some("sqlite:tally.db?mode=rwc".into()),
//!     ..Default::default()
//! };
//! let service = Arc::new(TallyService::connect(config, Arc::new(InMemoryPlatform::new())).await?);
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let runner = tokio::spawn({
//!     let service = service.clone();
//!     async move { service.run(shutdown_rx).await }
//! });
//!
//! // ... feed gateway events into service.record_message(..) ...
//!
//! shutdown_tx.send(true)?;
//! runner.await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::activity::{CounterKey, MessageEvent};
use crate::config::TallyConfig;
use crate::leaderboard::{Leaderboard, LeaderboardPage, LeaderboardQuery};
use crate::metrics;
use crate::platform::PlatformClient;
use crate::ranking::RankingCache;
use crate::snapshot::PageSnapshotCache;
use crate::storage::memory::{InMemoryArchive, InMemoryCache};
use crate::storage::redis::RedisStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{ArchiveStore, CacheStore, StorageError};
use crate::sync::status::SyncStatus;
use crate::sync::{MessageAnchor, SyncEngine, SyncError, SyncReport, SyncRequest};
use crate::write_behind::{FlushReport, WriteBehindBuffer};

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Built, flush loop not started
    Created,
    /// Flush loop running
    Running,
    /// Final flush in progress
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub state: ServiceState,
    pub cache_ok: bool,
    pub store_ok: bool,
    pub active_syncs: usize,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.cache_ok && self.store_ok
    }
}

pub struct TallyService {
    config: TallyConfig,
    cache: Arc<dyn CacheStore>,
    archive: Arc<dyn ArchiveStore>,
    buffer: Arc<WriteBehindBuffer>,
    ranking: Arc<RankingCache>,
    snapshots: Arc<PageSnapshotCache>,
    leaderboard: Leaderboard,
    sync: SyncEngine,
    /// Newest live message per guild since the last flush.
    live_anchors: DashMap<String, MessageAnchor>,
    live_since: DateTime<Utc>,
    state: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
}

impl TallyService {
    /// Connect to Redis and SQL as configured.
    #[tracing::instrument(skip_all)]
    pub async fn connect(config: TallyConfig, platform: Arc<dyn PlatformClient>) -> Result<Self, StorageError> {
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| StorageError::Backend("redis_url is not configured".to_string()))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| StorageError::Backend("sql_url is not configured".to_string()))?;

        let cache = RedisStore::with_prefix(&redis_url, config.redis_prefix.as_deref()).await?;
        metrics::set_backend_healthy("redis", true);
        let archive = SqlStore::new(&sql_url).await?.with_upsert_chunk(config.upsert_chunk_size);
        metrics::set_backend_healthy("sql", true);
        info!("Tally service connected");

        Ok(Self::new(config, Arc::new(cache), Arc::new(archive), platform))
    }

    /// Single-process service on in-memory backends.
    pub fn in_memory(config: TallyConfig, platform: Arc<dyn PlatformClient>) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryArchive::new()),
            platform,
        )
    }

    pub fn new(
        config: TallyConfig,
        cache: Arc<dyn CacheStore>,
        archive: Arc<dyn ArchiveStore>,
        platform: Arc<dyn PlatformClient>,
    ) -> Self {
        let live_since = Utc::now();
        let buffer = Arc::new(WriteBehindBuffer::new(cache.clone(), archive.clone()));
        let ranking = Arc::new(RankingCache::new(cache.clone()));
        let snapshots = Arc::new(PageSnapshotCache::new(cache.clone(), config.page_cache_ttl_secs));
        let leaderboard = Leaderboard::new(ranking.clone(), snapshots.clone(), archive.clone(), config.page_size());
        let sync = SyncEngine::new(
            archive.clone(),
            cache.clone(),
            platform,
            buffer.clone(),
            ranking.clone(),
            snapshots.clone(),
            &config,
        )
        .with_live_since(live_since);
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);

        Self {
            config,
            cache,
            archive,
            buffer,
            ranking,
            snapshots,
            leaderboard,
            sync,
            live_anchors: DashMap::new(),
            live_since,
            state: state_tx,
            state_rx,
        }
    }

    /// Replace the sync engine, e.g. to tune paging.
    #[must_use]
    pub fn with_sync_engine(mut self, configure: impl FnOnce(SyncEngine) -> SyncEngine) -> Self {
        self.sync = configure(self.sync);
        self
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    /// When this service started counting live events.
    #[must_use]
    pub fn live_since(&self) -> DateTime<Utc> {
        self.live_since
    }

    pub fn buffer(&self) -> &WriteBehindBuffer {
        &self.buffer
    }

    pub fn ranking(&self) -> &RankingCache {
        &self.ranking
    }

    pub fn snapshots(&self) -> &PageSnapshotCache {
        &self.snapshots
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Live path
    // ═══════════════════════════════════════════════════════════════════════════

    /// Count one live message.
    ///
    /// Bot authors and direct messages are ignored. The buffer increment,
    /// ranking increment and snapshot invalidation are independent and
    /// best-effort; failures are logged and never reach the caller.
    /// Returns whether the increment was buffered.
    pub async fn record_message(&self, event: &MessageEvent) -> bool {
        if event.author_is_bot {
            metrics::record_ignored_event("bot");
            return false;
        }
        let Some(guild_id) = event.guild_id.as_deref() else {
            metrics::record_ignored_event("direct_message");
            return false;
        };

        let key = CounterKey::new(event.author_id.clone(), event.channel_id.clone(), event.date());
        let live = self.ranking.live_guard(guild_id).await;
        let (buffered, ranked, invalidated) = tokio::join!(
            self.buffer.record_increment(guild_id, &key),
            self.ranking.increment(guild_id, &event.author_id, 1),
            self.snapshots.invalidate_guild(guild_id),
        );
        drop(live);

        match ranked {
            Ok(_) => metrics::record_increment("ranking", "success"),
            Err(e) => {
                warn!(guild_id = %guild_id, user_id = %event.author_id, error = %e, "Failed to update ranking");
                metrics::record_increment("ranking", "error");
            }
        }
        if let Err(e) = invalidated {
            warn!(guild_id = %guild_id, error = %e, "Failed to drop page snapshots");
            metrics::record_error("snapshot", "invalidate");
        }

        if buffered {
            let candidate = MessageAnchor::new(event.message_id.clone(), event.created_at);
            self.live_anchors
                .entry(guild_id.to_string())
                .and_modify(|current| {
                    if candidate.is_newer_than(current) {
                        *current = candidate.clone();
                    }
                })
                .or_insert_with(|| candidate.clone());
        }
        buffered
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Write-behind
    // ═══════════════════════════════════════════════════════════════════════════

    /// Flush the buffer, then move the anchors of guilds that already have
    /// one up to the newest flushed live message.
    pub async fn flush(&self) -> Result<FlushReport, StorageError> {
        let anchors: Vec<(String, MessageAnchor)> = self
            .live_anchors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let report = self.buffer.flush().await?;

        for (guild_id, anchor) in anchors {
            self.live_anchors.remove_if(&guild_id, |_, current| *current == anchor);
            if let Err(e) = self.persist_live_anchor(&guild_id, &anchor).await {
                warn!(guild_id = %guild_id, error = %e, "Failed to advance anchor after flush");
            }
        }
        Ok(report)
    }

    async fn persist_live_anchor(&self, guild_id: &str, anchor: &MessageAnchor) -> Result<(), StorageError> {
        let has_anchor = self
            .archive
            .load_sync_status(guild_id)
            .await?
            .is_some_and(|s| s.anchor.is_some());
        // guilds that never synced get their first anchor from a sync
        if has_anchor {
            self.archive.advance_anchor(guild_id, anchor).await?;
        }
        Ok(())
    }

    /// Run the periodic flush until `shutdown` flips to `true` (or its
    /// sender is dropped), then flush one last time.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let _ = self.state.send(ServiceState::Running);
        info!(interval_ms = self.config.flush_interval_ms, "Tally service running");

        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Final flush and state change. Safe to call more than once.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(&self) {
        info!("Initiating tally service shutdown...");
        let _ = self.state.send(ServiceState::ShuttingDown);
        self.flush_cycle().await;
        let _ = self.state.send(ServiceState::Stopped);
        info!("Tally service shutdown complete");
    }

    async fn flush_cycle(&self) {
        match self.flush().await {
            Ok(report) if report.lost_increments > 0 => {
                error!(lost = report.lost_increments, "Flush cycle lost increments");
            }
            Ok(report) => debug!(increments = report.increments, "Flush cycle complete"),
            Err(e) => {
                error!(error = %e, "Flush cycle failed");
                metrics::record_error("buffer", "flush");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads and syncs
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn leaderboard(&self, query: &LeaderboardQuery) -> Result<LeaderboardPage, StorageError> {
        self.leaderboard.page(query).await
    }

    pub async fn full_resync(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        self.sync.full_resync(request).await
    }

    pub async fn incremental_sync(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        self.sync.incremental_sync(request).await
    }

    pub async fn catch_up(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        self.sync.catch_up(request).await
    }

    pub async fn sync_status(&self, guild_id: &str) -> Result<Option<SyncStatus>, SyncError> {
        self.sync.status(guild_id).await
    }

    /// Ping both backends.
    pub async fn health_check(&self) -> HealthReport {
        let (cache, store) = tokio::join!(self.cache.ping(), self.archive.ping());
        if let Err(ref e) = cache {
            warn!(error = %e, "Cache health check failed");
        }
        if let Err(ref e) = store {
            warn!(error = %e, "Store health check failed");
        }
        metrics::set_backend_healthy("cache", cache.is_ok());
        metrics::set_backend_healthy("store", store.is_ok());
        HealthReport {
            state: self.state(),
            cache_ok: cache.is_ok(),
            store_ok: store.is_ok(),
            active_syncs: self.sync.active_runs(),
            checked_at: Utc::now(),
        }
    }
}
