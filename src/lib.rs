//! # Tally Engine
//!
//! Per-user message activity counters for multi-tenant chat, with a
//! write-behind buffer in front of SQL, a live ranking cache, and crash-safe
//! history resync.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Live event path                        │
//! │  • TallyService::record_message(event)                      │
//! │  • Bots and direct messages ignored                         │
//! │  • Best-effort: cache failures never reach the caller       │
//! └─────────────────────────────────────────────────────────────┘
//!          │ +1 per (user, channel, day)      │ +1 per user
//!          ▼                                  ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  Write-behind buffer     │   │  Ranking cache (sorted set)  │
//! │  dirty_counts:{guild}    │   │  leaderboard:{guild}         │
//! │  atomic drain per flush  │   │  rebuilt after every sync    │
//! └──────────────────────────┘   └──────────────────────────────┘
//!          │ periodic flush (additive upsert)           ▲
//!          ▼                                            │
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Counter store (MySQL / SQLite)                │
//! │  • message_counts: ground truth                             │
//! │  • sync_status: mode, phase, checkpoint, anchor             │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲ bulk upsert                                │ grouped sums
//!          │                                            ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │  Sync engine             │   │  Leaderboard queries         │
//! │  full / incremental /    │   │  filtered pages cached as    │
//! │  catch-up, one per guild │   │  short-lived page snapshots  │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tally_engine::{LeaderboardQuery, TallyConfig, TallyService};
//! use tally_engine::activity::MessageEvent;
//! use tally_engine::platform::memory::InMemoryPlatform;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TallyConfig::default();
//!     let service = TallyService::in_memory(config, Arc::new(InMemoryPlatform::new()));
//!
//!     service.record_message(&MessageEvent {
//!         guild_id: Some("1001".into()),
//!         message_id: "5001".into(),
//!         channel_id: "2001".into(),
//!         author_id: "3001".into(),
//!         author_is_bot: false,
//!         created_at: chrono::Utc::now(),
//!     }).await;
//!
//!     let page = service.leaderboard(&LeaderboardQuery::new("1001", "3001")).await.unwrap();
//!     println!("rank: {:?}", page.requester_rank);
//!
//!     service.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`service`]: [`TallyService`], the facade tying everything together
//! - [`write_behind`]: dirty accumulators and the periodic flush
//! - [`ranking`]: lifetime ranking sorted set
//! - [`snapshot`]: short-lived leaderboard page snapshots
//! - [`leaderboard`]: paged, optionally filtered leaderboard queries
//! - [`sync`]: full, incremental and catch-up history sync
//! - [`dispatch`]: command registry and dispatcher
//! - [`storage`]: cache and counter store backends (Redis, SQL, memory)
//! - [`platform`]: chat platform seam
//! - [`resilience`]: retry policies

pub mod activity;
pub mod config;
pub mod dispatch;
pub mod keyspace;
pub mod leaderboard;
pub mod metrics;
pub mod platform;
pub mod ranking;
pub mod resilience;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod sync;
pub mod write_behind;

pub use activity::{CounterKey, CounterRecord, LeaderboardFilter, MessageEvent};
pub use config::TallyConfig;
pub use dispatch::{CommandKind, CommandRegistry, CommandReply, Dispatcher, Invocation};
pub use leaderboard::{Leaderboard, LeaderboardPage, LeaderboardQuery};
pub use metrics::LatencyTimer;
pub use platform::{PlatformClient, PlatformError};
pub use ranking::{RankedRow, RankingCache};
pub use resilience::retry::RetryConfig;
pub use service::{HealthReport, ServiceState, TallyService};
pub use snapshot::{PageSnapshot, PageSnapshotCache};
pub use storage::traits::{ArchiveStore, CacheStore, StorageError};
pub use sync::status::SyncStatus;
pub use sync::{SyncEngine, SyncError, SyncMode, SyncReport, SyncRequest};
pub use write_behind::{FlushReport, WriteBehindBuffer};
