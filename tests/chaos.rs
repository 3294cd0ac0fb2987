//! Chaos Testing for Tally Engine
//!
//! Failure scenarios on in-memory backends using:
//! 1. **Failing store wrappers** - inject errors into chosen cache/store operations
//! 2. **Panicking platform** - a history fetch that panics mid-sync
//! 3. **Garbage data** - malformed write-behind fields
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use tally_engine::activity::{parse_date, CounterKey, CounterRecord, LeaderboardFilter, MessageEvent};
use tally_engine::keyspace;
use tally_engine::platform::memory::InMemoryPlatform;
use tally_engine::platform::{HistoryQuery, Location, NoticeHandle, PlatformClient, PlatformError, PlatformMessage};
use tally_engine::storage::memory::{InMemoryArchive, InMemoryCache};
use tally_engine::storage::traits::{ArchiveStore, CacheStore, StorageError, UserTotal};
use tally_engine::sync::lock::SyncLock;
use tally_engine::sync::status::SyncStatus;
use tally_engine::sync::{MessageAnchor, SyncPhase};
use tally_engine::{
    CommandRegistry, CommandReply, Dispatcher, Invocation, SyncError, SyncRequest, TallyConfig, TallyService,
};

const GUILD: &str = "1001";

// =============================================================================
// Failing Store Wrappers - Targeted Error Injection
// =============================================================================

/// Which operations fail, shared by both wrappers.
#[derive(Default)]
struct Faults {
    ops: Mutex<HashSet<&'static str>>,
    everything: AtomicBool,
    injected: AtomicU64,
}

impl Faults {
    fn fail(&self, op: &'static str) {
        self.ops.lock().insert(op);
    }

    fn fail_everything(&self) {
        self.everything.store(true, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.ops.lock().clear();
        self.everything.store(false, Ordering::SeqCst);
    }

    fn check(&self, op: &'static str) -> Result<(), StorageError> {
        if self.everything.load(Ordering::SeqCst) || self.ops.lock().contains(op) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Backend(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

struct FailingCacheStore {
    inner: Arc<InMemoryCache>,
    faults: Faults,
    /// When set, `zset_replace` signals `replacing` and stalls before writing.
    stall_replace: AtomicBool,
    replacing: Notify,
}

impl FailingCacheStore {
    fn new(inner: Arc<InMemoryCache>) -> Self {
        Self {
            inner,
            faults: Faults::default(),
            stall_replace: AtomicBool::new(false),
            replacing: Notify::new(),
        }
    }
}

#[async_trait]
impl CacheStore for FailingCacheStore {
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        self.faults.check("hash_incr")?;
        self.inner.hash_incr(key, field, delta).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        self.faults.check("hash_get_all")?;
        self.inner.hash_get_all(key).await
    }

    async fn hash_take_all(&self, key: &str) -> Result<Vec<(String, i64)>, StorageError> {
        self.faults.check("hash_take_all")?;
        self.inner.hash_take_all(key).await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.faults.check("keys_with_prefix")?;
        self.inner.keys_with_prefix(prefix).await
    }

    async fn zset_incr(&self, key: &str, member: &str, delta: f64) -> Result<f64, StorageError> {
        self.faults.check("zset_incr")?;
        self.inner.zset_incr(key, member, delta).await
    }

    async fn zset_rev_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<(String, f64)>, StorageError> {
        self.faults.check("zset_rev_range")?;
        self.inner.zset_rev_range(key, start, stop).await
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        self.faults.check("zset_score")?;
        self.inner.zset_score(key, member).await
    }

    async fn zset_count_above(&self, key: &str, score: f64) -> Result<u64, StorageError> {
        self.faults.check("zset_count_above")?;
        self.inner.zset_count_above(key, score).await
    }

    async fn zset_card(&self, key: &str) -> Result<u64, StorageError> {
        self.faults.check("zset_card")?;
        self.inner.zset_card(key).await
    }

    async fn zset_replace(&self, key: &str, entries: &[(String, f64)]) -> Result<(), StorageError> {
        self.faults.check("zset_replace")?;
        if self.stall_replace.load(Ordering::SeqCst) {
            self.replacing.notify_one();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        self.inner.zset_replace(key, entries).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.faults.check("get")?;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StorageError> {
        self.faults.check("set_ex")?;
        self.inner.set_ex(key, value, ttl_secs).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        self.faults.check("set_nx_ex")?;
        self.inner.set_nx_ex(key, value, ttl_secs).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.faults.check("delete")?;
        self.inner.delete(key).await
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        self.faults.check("delete_if_eq")?;
        self.inner.delete_if_eq(key, expected).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        self.faults.check("incr")?;
        self.inner.incr(key).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.faults.check("ping")?;
        self.inner.ping().await
    }
}

struct FailingArchiveStore {
    inner: Arc<InMemoryArchive>,
    faults: Faults,
}

impl FailingArchiveStore {
    fn new(inner: Arc<InMemoryArchive>) -> Self {
        Self {
            inner,
            faults: Faults::default(),
        }
    }
}

#[async_trait]
impl ArchiveStore for FailingArchiveStore {
    async fn upsert_counts(&self, records: &[CounterRecord]) -> Result<usize, StorageError> {
        self.faults.check("upsert_counts")?;
        self.inner.upsert_counts(records).await
    }

    async fn delete_guild(&self, guild_id: &str) -> Result<u64, StorageError> {
        self.faults.check("delete_guild")?;
        self.inner.delete_guild(guild_id).await
    }

    async fn delete_location(&self, guild_id: &str, channel_id: &str) -> Result<u64, StorageError> {
        self.faults.check("delete_location")?;
        self.inner.delete_location(guild_id, channel_id).await
    }

    async fn user_totals(&self, guild_id: &str) -> Result<Vec<UserTotal>, StorageError> {
        self.faults.check("user_totals")?;
        self.inner.user_totals(guild_id).await
    }

    async fn filtered_page(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UserTotal>, StorageError> {
        self.faults.check("filtered_page")?;
        self.inner.filtered_page(guild_id, filter, offset, limit).await
    }

    async fn filtered_user_count(&self, guild_id: &str, filter: &LeaderboardFilter) -> Result<u64, StorageError> {
        self.faults.check("filtered_user_count")?;
        self.inner.filtered_user_count(guild_id, filter).await
    }

    async fn filtered_rank(
        &self,
        guild_id: &str,
        filter: &LeaderboardFilter,
        user_id: &str,
    ) -> Result<Option<u64>, StorageError> {
        self.faults.check("filtered_rank")?;
        self.inner.filtered_rank(guild_id, filter, user_id).await
    }

    async fn count_for(&self, guild_id: &str, key: &CounterKey) -> Result<u64, StorageError> {
        self.faults.check("count_for")?;
        self.inner.count_for(guild_id, key).await
    }

    async fn load_sync_status(&self, guild_id: &str) -> Result<Option<SyncStatus>, StorageError> {
        self.faults.check("load_sync_status")?;
        self.inner.load_sync_status(guild_id).await
    }

    async fn save_sync_status(&self, status: &SyncStatus) -> Result<(), StorageError> {
        self.faults.check("save_sync_status")?;
        self.inner.save_sync_status(status).await
    }

    async fn advance_anchor(&self, guild_id: &str, anchor: &MessageAnchor) -> Result<(), StorageError> {
        self.faults.check("advance_anchor")?;
        self.inner.advance_anchor(guild_id, anchor).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.faults.check("ping")?;
        self.inner.ping().await
    }
}

/// Delegates to an in-memory platform but panics when one location is read.
struct PanickingPlatform {
    inner: Arc<InMemoryPlatform>,
    poisoned_location: String,
}

#[async_trait]
impl PlatformClient for PanickingPlatform {
    async fn locations(&self, guild_id: &str) -> Result<Vec<Location>, PlatformError> {
        self.inner.locations(guild_id).await
    }

    async fn fetch_messages(
        &self,
        guild_id: &str,
        location_id: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<PlatformMessage>, PlatformError> {
        if location_id == self.poisoned_location {
            panic!("history decoder blew up on {location_id}");
        }
        self.inner.fetch_messages(guild_id, location_id, query).await
    }

    async fn send_notice(&self, recipient: &str, content: &str) -> Result<NoticeHandle, PlatformError> {
        self.inner.send_notice(recipient, content).await
    }

    async fn edit_notice(&self, handle: &NoticeHandle, content: &str) -> Result<(), PlatformError> {
        self.inner.edit_notice(handle, content).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Rig {
    service: TallyService,
    cache: Arc<FailingCacheStore>,
    archive: Arc<FailingArchiveStore>,
    raw_cache: Arc<InMemoryCache>,
    raw_archive: Arc<InMemoryArchive>,
}

fn rig(platform: Arc<dyn PlatformClient>) -> Rig {
    let raw_cache = Arc::new(InMemoryCache::new());
    let raw_archive = Arc::new(InMemoryArchive::new());
    let cache = Arc::new(FailingCacheStore::new(raw_cache.clone()));
    let archive = Arc::new(FailingArchiveStore::new(raw_archive.clone()));
    let config = TallyConfig {
        history_page_limit: 5,
        ..Default::default()
    };
    let service = TallyService::new(config, cache.clone(), archive.clone(), platform);
    Rig {
        service,
        cache,
        archive,
        raw_cache,
        raw_archive,
    }
}

fn seeded_platform() -> Arc<InMemoryPlatform> {
    let platform = Arc::new(InMemoryPlatform::new());
    platform.add_location(GUILD, "100", "general");
    platform.add_location(GUILD, "200", "dev");
    platform.add_location(GUILD, "300", "random");
    let t: DateTime<Utc> = "2024-01-01T10:00:00Z".parse().unwrap();
    for i in 0..12 {
        platform.post(GUILD, "100", "u1", false, t + Duration::minutes(i));
    }
    for i in 0..6 {
        platform.post(GUILD, "200", "u2", false, t + Duration::minutes(i));
    }
    platform.post(GUILD, "300", "u3", false, t);
    platform
}

fn key(user: &str, channel: &str) -> CounterKey {
    CounterKey::new(user, channel, parse_date("2024-01-01").unwrap())
}

fn event(id: &str, author: &str) -> MessageEvent {
    MessageEvent {
        guild_id: Some(GUILD.into()),
        message_id: id.into(),
        channel_id: "100".into(),
        author_id: author.into(),
        author_is_bot: false,
        created_at: "2024-01-01T10:00:00Z".parse().unwrap(),
    }
}

async fn assert_unlocked(cache: Arc<dyn CacheStore>) {
    let lock = SyncLock::new(cache, 60);
    assert!(lock.holder(GUILD).await.unwrap().is_none(), "sync lock leaked");
}

// =============================================================================
// Chaos Tests - Live Path
// =============================================================================

#[tokio::test]
async fn chaos_cache_down_live_path_never_errors() {
    let r = rig(Arc::new(InMemoryPlatform::new()));
    r.cache.faults.fail_everything();

    for i in 0..10 {
        assert!(!r.service.record_message(&event(&i.to_string(), "u1")).await);
    }
    assert!(r.cache.faults.injected.load(Ordering::SeqCst) >= 30);

    // the flush itself cannot list dirty guilds
    assert!(r.service.flush().await.is_err());

    r.cache.faults.heal();
    assert!(r.service.record_message(&event("11", "u1")).await);
    r.service.flush().await.unwrap();
    assert_eq!(r.raw_archive.count_for(GUILD, &key("u1", "100")).await.unwrap(), 1);
}

#[tokio::test]
async fn chaos_ranking_failure_does_not_block_buffer() {
    let r = rig(Arc::new(InMemoryPlatform::new()));
    r.cache.faults.fail("zset_incr");
    r.cache.faults.fail("incr");

    assert!(r.service.record_message(&event("1", "u1")).await);
    r.service.flush().await.unwrap();
    assert_eq!(r.raw_archive.count_for(GUILD, &key("u1", "100")).await.unwrap(), 1);
    assert!(!r.raw_cache.contains_key(&keyspace::ranking(GUILD)));
}

#[tokio::test]
async fn chaos_upsert_failure_drops_batch_as_data_loss() {
    let r = rig(Arc::new(InMemoryPlatform::new()));
    for i in 0..3 {
        r.service.record_message(&event(&i.to_string(), "u1")).await;
    }
    r.archive.faults.fail("upsert_counts");

    let report = r.service.flush().await.unwrap();
    assert_eq!(report.lost_increments, 3);
    assert_eq!(report.increments, 0);
    assert!(r.service.buffer().pending(GUILD).await.unwrap().is_empty());

    r.archive.faults.heal();
    r.service.flush().await.unwrap();
    assert!(r.raw_archive.is_empty());
}

#[tokio::test]
async fn chaos_malformed_dirty_fields_are_skipped() {
    let r = rig(Arc::new(InMemoryPlatform::new()));
    let dirty = keyspace::dirty_counts(GUILD);
    r.raw_cache.hash_incr(&dirty, "garbage", 4).await.unwrap();
    r.raw_cache.hash_incr(&dirty, "u1:100:2024-99-01", 2).await.unwrap();
    r.raw_cache.hash_incr(&dirty, &key("u2", "100").encode(), 5).await.unwrap();

    let report = r.service.flush().await.unwrap();
    assert_eq!(report.malformed, 2);
    assert_eq!(report.increments, 5);
    assert_eq!(r.raw_archive.count_for(GUILD, &key("u2", "100")).await.unwrap(), 5);
    assert!(!r.raw_cache.contains_key(&dirty));
}

#[tokio::test]
async fn chaos_leaderboard_with_store_down() {
    let r = rig(Arc::new(InMemoryPlatform::new()));
    r.archive.faults.fail_everything();
    let registry = CommandRegistry::standard();
    let dispatcher = Dispatcher::new(&registry, &r.service);

    // unfiltered pages come from the cache alone
    let reply = dispatcher.dispatch(&Invocation::new("leaderboard", "u1").in_guild(GUILD)).await;
    assert!(matches!(reply, CommandReply::Leaderboard(_)));

    let reply = dispatcher
        .dispatch(&Invocation::new("leaderboard", "u1").in_guild(GUILD).option("channel", "100"))
        .await;
    assert!(matches!(reply, CommandReply::Unavailable(_)));

    let health = r.service.health_check().await;
    assert!(health.cache_ok);
    assert!(!health.store_ok);
    assert!(!health.is_healthy());
}

// =============================================================================
// Chaos Tests - Sync Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn chaos_failed_full_resync_marks_failed_and_releases_lock() {
    let r = rig(seeded_platform());
    r.archive.faults.fail("upsert_counts");

    let err = r.service.full_resync(&SyncRequest::new(GUILD).notify("admin")).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));
    let status = r.raw_archive.load_sync_status(GUILD).await.unwrap().unwrap();
    assert_eq!(status.phase, SyncPhase::Failed);
    assert!(status.anchor.is_none());
    assert_unlocked(r.raw_cache.clone()).await;

    r.archive.faults.heal();
    let report = r.service.full_resync(&SyncRequest::new(GUILD)).await.unwrap();
    assert_eq!(report.messages_counted, 19);
    assert_eq!(r.raw_archive.count_for(GUILD, &key("u1", "100")).await.unwrap(), 12);
}

#[tokio::test(start_paused = true)]
async fn chaos_worker_panic_aborts_full_resync() {
    let inner = seeded_platform();
    let platform = Arc::new(PanickingPlatform {
        inner: inner.clone(),
        poisoned_location: "200".into(),
    });
    let r = rig(platform);

    let err = r
        .service
        .full_resync(&SyncRequest::new(GUILD).with_parallelism(3))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::WorkerCrashed(_)));
    assert!(r.raw_archive.is_empty());
    let status = r.raw_archive.load_sync_status(GUILD).await.unwrap().unwrap();
    assert_eq!(status.phase, SyncPhase::Failed);
    assert_unlocked(r.raw_cache.clone()).await;
    assert_eq!(r.service.sync_engine().active_runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn chaos_panic_in_incremental_sync_is_contained() {
    let inner = seeded_platform();
    let platform = Arc::new(PanickingPlatform {
        inner: inner.clone(),
        poisoned_location: "300".into(),
    });
    let r = rig(platform);

    let err = r.service.incremental_sync(&SyncRequest::new(GUILD)).await.unwrap_err();
    match err {
        SyncError::WorkerCrashed(reason) => assert!(reason.contains("history decoder")),
        other => panic!("expected a crash, got {other:?}"),
    }
    let status = r.raw_archive.load_sync_status(GUILD).await.unwrap().unwrap();
    assert_eq!(status.phase, SyncPhase::Failed);
    assert_eq!(status.last_checkpoint.as_deref(), Some("200"));
    assert_unlocked(r.raw_cache.clone()).await;
}

#[tokio::test(start_paused = true)]
async fn chaos_transient_platform_errors_are_retried() {
    let platform = seeded_platform();
    for _ in 0..3 {
        platform.push_fault("100", PlatformError::Transient("429 Too Many Requests".into()));
    }
    let r = rig(platform);

    r.service.full_resync(&SyncRequest::new(GUILD)).await.unwrap();
    assert_eq!(r.raw_archive.count_for(GUILD, &key("u1", "100")).await.unwrap(), 12);
}

#[tokio::test(start_paused = true)]
async fn chaos_persistent_rate_limit_fails_sync() {
    let platform = seeded_platform();
    platform.break_location("200", PlatformError::Transient("429 Too Many Requests".into()));
    let r = rig(platform);

    let err = r.service.full_resync(&SyncRequest::new(GUILD)).await.unwrap_err();
    assert!(matches!(err, SyncError::Platform(PlatformError::Transient(_))));
    assert_unlocked(r.raw_cache.clone()).await;
}

#[tokio::test(start_paused = true)]
async fn chaos_ranking_rebuild_failure_fails_sync() {
    let r = rig(seeded_platform());
    r.cache.faults.fail("zset_replace");

    let err = r.service.full_resync(&SyncRequest::new(GUILD)).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));
    let status = r.raw_archive.load_sync_status(GUILD).await.unwrap().unwrap();
    assert_eq!(status.phase, SyncPhase::Failed);
    // counts landed; a rerun rebuilds the ranking
    assert_eq!(r.raw_archive.count_for(GUILD, &key("u1", "100")).await.unwrap(), 12);

    r.cache.faults.heal();
    r.service.full_resync(&SyncRequest::new(GUILD)).await.unwrap();
    assert_eq!(r.service.ranking().rank_of(GUILD, "u1").await.unwrap(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn chaos_live_message_during_ranking_rebuild_is_kept() {
    let r = rig(seeded_platform());
    r.cache.stall_replace.store(true, Ordering::SeqCst);

    let req = SyncRequest::new(GUILD);
    let sync = r.service.full_resync(&req);
    let live = async {
        r.cache.replacing.notified().await;
        r.service.record_message(&event("9000", "u1")).await
    };
    let (report, buffered) = tokio::join!(sync, live);
    report.unwrap();
    assert!(buffered);

    r.service.flush().await.unwrap();
    assert_eq!(r.raw_archive.count_for(GUILD, &key("u1", "100")).await.unwrap(), 13);
    let score = r.raw_cache.zset_score(&keyspace::ranking(GUILD), "u1").await.unwrap();
    assert_eq!(score, Some(13.0));
}

#[tokio::test(start_paused = true)]
async fn chaos_lock_backend_down_rejects_sync() {
    let r = rig(seeded_platform());
    r.cache.faults.fail("set_nx_ex");

    let err = r.service.full_resync(&SyncRequest::new(GUILD)).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));
    assert!(r.raw_archive.load_sync_status(GUILD).await.unwrap().is_none());
}
