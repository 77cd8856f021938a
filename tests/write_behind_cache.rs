//! End-to-end cache scenarios against an in-memory backing store
//!
//! All tests run on tokio's paused clock so cycle timing is deterministic.
//! The adapter splits each backing value into two halves so that two cache
//! instances can own one half each, which exercises resync merging the way
//! a real externally-shared store would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::sleep;

use stratus::config::ResyncFailedFinalAction;
use stratus::{
    CacheAdapter, CacheConfig, CacheError, EventListener, EventRecord, StorageError,
    WriteBehindCache,
};

/// Which half of the backing pair this cache instance owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Half {
    Hi,
    Lo,
}

type Backing = Arc<DashMap<u64, (String, String)>>;

/// Test adapter over a shared `{key: (hi, lo)}` map
///
/// Reads return the whole pair; writes replace only this instance's half.
/// Failures are scripted per call, and per-key guards detect overlapping
/// storage calls.
struct SignalAdapter {
    half: Half,
    backing: Backing,
    reads: Mutex<Vec<(u64, bool)>>,
    writes: Mutex<Vec<(u64, String)>>,
    split_previous: Mutex<Vec<Option<String>>>,
    read_script: Mutex<VecDeque<StorageError>>,
    write_script: Mutex<VecDeque<StorageError>>,
    refresh_delay: Mutex<Duration>,
    reading_keys: DashMap<u64, ()>,
    writing_keys: DashMap<u64, ()>,
    overlap_detected: AtomicBool,
}

impl SignalAdapter {
    fn new(half: Half, backing: Backing) -> AdapterHandle {
        AdapterHandle(Arc::new(Self {
            half,
            backing,
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            split_previous: Mutex::new(Vec::new()),
            read_script: Mutex::new(VecDeque::new()),
            write_script: Mutex::new(VecDeque::new()),
            refresh_delay: Mutex::new(Duration::ZERO),
            reading_keys: DashMap::new(),
            writing_keys: DashMap::new(),
            overlap_detected: AtomicBool::new(false),
        }))
    }

    fn read_count(&self) -> usize {
        self.reads.lock().len()
    }

    fn fail_next_reads(&self, errors: Vec<StorageError>) {
        self.read_script.lock().extend(errors);
    }

    fn fail_next_writes(&self, errors: Vec<StorageError>) {
        self.write_script.lock().extend(errors);
    }

    fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    fn assert_no_overlapping_storage_calls(&self) {
        assert!(
            !self.overlap_detected.load(Ordering::Acquire),
            "overlapping storage calls observed for one key"
        );
    }
}

// Local newtype so `CacheAdapter` (defined in `stratus`) can be implemented
// for a shared handle without running afoul of the orphan rules that block
// implementing it directly for `Arc<SignalAdapter>`.
#[derive(Clone)]
struct AdapterHandle(Arc<SignalAdapter>);

impl std::ops::Deref for AdapterHandle {
    type Target = SignalAdapter;

    fn deref(&self) -> &SignalAdapter {
        &self.0
    }
}

#[async_trait]
impl CacheAdapter for AdapterHandle {
    type Key = u64;
    type Value = (String, String);
    type Cached = (String, String);
    type StorageRead = (String, String);
    type StorageWrite = String;
    type Update = char;
    type LogEntry = char;

    async fn read_from_storage(
        &self,
        key: &u64,
        is_refresh: bool,
    ) -> Result<(String, String), StorageError> {
        if self.reading_keys.insert(*key, ()).is_some() {
            self.overlap_detected.store(true, Ordering::Release);
        }
        self.reads.lock().push((*key, is_refresh));
        let scripted = self.read_script.lock().pop_front();
        let delay = if is_refresh {
            *self.refresh_delay.lock()
        } else {
            Duration::ZERO
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.reading_keys.remove(key);
        if let Some(error) = scripted {
            return Err(error);
        }
        Ok(self
            .backing
            .get(key)
            .map(|pair| pair.clone())
            .unwrap_or_default())
    }

    async fn write_to_storage(&self, key: &u64, write: String) -> Result<(), StorageError> {
        if self.writing_keys.insert(*key, ()).is_some() {
            self.overlap_detected.store(true, Ordering::Release);
        }
        self.writes.lock().push((*key, write.clone()));
        let scripted = self.write_script.lock().pop_front();
        self.writing_keys.remove(key);
        if let Some(error) = scripted {
            return Err(error);
        }
        let mut pair = self.backing.entry(*key).or_default();
        match self.half {
            Half::Hi => pair.0 = write,
            Half::Lo => pair.1 = write,
        }
        Ok(())
    }

    fn to_internal_update(&self, _key: &u64, update: char) -> char {
        update
    }

    fn to_cache_format(&self, _key: &u64, raw: (String, String)) -> (String, String) {
        raw
    }

    fn to_return_value(&self, _key: &u64, cached: &(String, String)) -> (String, String) {
        cached.clone()
    }

    fn apply_update(&self, mut cached: (String, String), update: &char) -> (String, String) {
        match self.half {
            Half::Hi => cached.0.push(*update),
            Half::Lo => cached.1.push(*update),
        }
        cached
    }

    fn split_for_write(
        &self,
        _key: &u64,
        cached: (String, String),
        previous_failed: Option<String>,
    ) -> ((String, String), String) {
        self.split_previous.lock().push(previous_failed);
        let write = match self.half {
            Half::Hi => cached.0.clone(),
            Half::Lo => cached.1.clone(),
        };
        (cached, write)
    }
}

struct EventRecorder {
    records: Mutex<Vec<EventRecord>>,
}

impl EventRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    fn count(&self, classifier: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.classifier == classifier)
            .count()
    }
}

impl EventListener for EventRecorder {
    fn on_event(&self, record: &EventRecord) {
        self.records.lock().push(record.clone());
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

fn test_config(name: &str) -> CacheConfig {
    let mut config = CacheConfig::new(name)
        .with_cache_time(Duration::from_millis(1_000))
        .with_return_queue_time(Duration::from_millis(300));
    config.max_sleep_time = Duration::from_millis(50);
    config.event_notification_enabled = true;
    config
}

fn started_cache(
    config: CacheConfig,
    adapter: AdapterHandle,
) -> (WriteBehindCache<AdapterHandle>, Arc<EventRecorder>) {
    let cache = WriteBehindCache::new(config, adapter).expect("valid config");
    let recorder = EventRecorder::new();
    cache.set_event_listener(recorder.clone());
    cache.start().expect("start once");
    (cache, recorder)
}

#[tokio::test(start_paused = true)]
async fn test_signal_accumulator_across_two_instances() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let hi_adapter = SignalAdapter::new(Half::Hi, backing.clone());
    let lo_adapter = SignalAdapter::new(Half::Lo, backing.clone());
    let (hi, _) = started_cache(test_config("hi"), hi_adapter.clone());
    let (lo, _) = started_cache(test_config("lo"), lo_adapter.clone());

    hi.preload(123).await.unwrap();
    hi.read_for(123, Duration::from_secs(1)).await.unwrap();
    hi.write_if_cached(123, 'A').unwrap();
    hi.write_if_cached(123, 'B').unwrap();

    lo.preload(123).await.unwrap();
    lo.read_for(123, Duration::from_secs(1)).await.unwrap();
    lo.write_if_cached(123, 'x').unwrap();

    // One full cycle drains both instances' writes.
    sleep(Duration::from_millis(3_000)).await;

    let pair = backing.get(&123).map(|p| p.clone()).unwrap();
    assert_eq!(pair, ("AB".to_string(), "x".to_string()));

    // The H instance sees L's half once it has reconciled.
    let value = hi.read_for(123, Duration::from_secs(1)).await.unwrap();
    assert_eq!(value, ("AB".to_string(), "x".to_string()));

    hi_adapter.assert_no_overlapping_storage_calls();
    lo_adapter.assert_no_overlapping_storage_calls();
}

#[tokio::test(start_paused = true)]
async fn test_read_retries_then_success() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    backing.insert(7, ("seed".to_string(), String::new()));
    let adapter = SignalAdapter::new(Half::Hi, backing);
    adapter.fail_next_reads(vec![
        StorageError::Transient("blip 1".into()),
        StorageError::Transient("blip 2".into()),
    ]);

    let mut config = test_config("retry");
    config.read_failure_max_retry_count = 2;
    let (cache, recorder) = started_cache(config, adapter.clone());

    cache.preload(7).await.unwrap();
    let value = cache.read_for(7, Duration::from_secs(10)).await.unwrap();
    assert_eq!(value.0, "seed");

    assert_eq!(recorder.count("storage_read_retry_issued"), 2);
    let status = cache.status(Duration::ZERO);
    assert_eq!(status.reads_attempted, 3);
    assert_eq!(status.reads_succeeded, 1);
    assert_eq!(status.read_retries, 2);
    assert_eq!(status.reads_failed_final, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_merges_into_next_cycle() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing.clone());
    adapter.fail_next_writes(vec![StorageError::Permanent("disk on fire".into())]);

    let mut config = test_config("merge");
    config.can_merge_writes = true;
    let (cache, recorder) = started_cache(config, adapter.clone());

    cache.preload(1).await.unwrap();
    cache.read_for(1, Duration::from_secs(1)).await.unwrap();
    cache.write_if_cached(1, 'a').unwrap();

    // First cycle: the write of "a" fails permanently and is retained.
    sleep(Duration::from_millis(1_200)).await;
    assert_eq!(recorder.count("storage_write_fail_final"), 1);

    cache.write_if_cached(1, 'b').unwrap();

    // Next cycle: the retained write merges with the new update.
    sleep(Duration::from_millis(1_500)).await;

    let writes = adapter.writes.lock().clone();
    assert_eq!(writes[0], (1, "a".to_string()));
    assert_eq!(writes[1], (1, "ab".to_string()));

    let splits = adapter.split_previous.lock().clone();
    assert_eq!(splits[0], None);
    assert_eq!(splits[1], Some("a".to_string()));

    assert_eq!(backing.get(&1).unwrap().0, "ab");
}

#[tokio::test(start_paused = true)]
async fn test_return_queue_dwell_serves_reads_from_memory() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing);
    let (cache, _) = started_cache(test_config("dwell"), adapter.clone());

    cache.preload(5).await.unwrap();
    cache.read_for(5, Duration::from_secs(1)).await.unwrap();
    assert_eq!(adapter.read_count(), 1);
    cache.write_if_cached(5, 'a').unwrap();

    // Write lands at the first cycle boundary; read inside the post-write
    // dwell must not touch the backing store again.
    sleep(Duration::from_millis(1_100)).await;
    let value = cache.read_for(5, Duration::from_secs(1)).await.unwrap();
    assert_eq!(value.0, "a");
    assert_eq!(adapter.read_count(), 1);

    // After the dwell the entry is evicted; the next read reloads.
    sleep(Duration::from_millis(700)).await;
    assert_eq!(cache.entry_count(), 0);
    cache.read_for(5, Duration::from_secs(1)).await.unwrap();
    assert_eq!(adapter.read_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hard_cap_rejects_fourth_entry() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing);
    let mut config = test_config("cap");
    config.main_queue_max_target_size = 3;
    config.max_cache_elements_hard_limit = 3;
    let (cache, _) = started_cache(config, adapter);

    for key in 0..3 {
        cache.preload(key).await.unwrap();
    }
    let err = cache.preload(99).await.unwrap_err();
    assert_eq!(err, CacheError::CacheFull(3));
    assert_eq!(cache.entry_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_preloads_issue_one_read() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing);
    let (cache, _) = started_cache(test_config("race"), adapter.clone());
    let cache = Arc::new(cache);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.preload(42).await })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    cache.read_for(42, Duration::from_secs(1)).await.unwrap();
    assert_eq!(adapter.read_count(), 1);
    assert_eq!(cache.status(Duration::ZERO).entries_created, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_pending_writes() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing.clone());
    let (cache, _) = started_cache(test_config("drain"), adapter);

    cache.preload(9).await.unwrap();
    cache.read_for(9, Duration::from_secs(1)).await.unwrap();
    cache.write_if_cached(9, 'z').unwrap();

    let undrained = cache.shutdown_for(Duration::from_secs(30), true, true).await;
    assert_eq!(undrained, 0);
    assert_eq!(backing.get(&9).unwrap().0, "z");

    let status = cache.status(Duration::ZERO);
    assert_eq!(status.read_queue_size, 0);
    assert_eq!(status.write_queue_size, 0);
    assert_eq!(status.main_queue_size, 0);
    assert_eq!(status.return_queue_size, 0);

    // Every public operation now reports shutdown.
    assert_eq!(cache.preload(1).await.unwrap_err(), CacheError::Shutdown);
    assert_eq!(
        cache.write_if_cached(9, 'q').unwrap_err(),
        CacheError::Shutdown
    );
    assert_eq!(
        cache
            .read_for(9, Duration::from_secs(1))
            .await
            .unwrap_err(),
        CacheError::Shutdown
    );
}

#[tokio::test(start_paused = true)]
async fn test_resync_picks_up_external_changes() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing.clone());
    let (cache, _) = started_cache(test_config("resync"), adapter);

    cache.preload(3).await.unwrap();
    cache.read_for(3, Duration::from_secs(1)).await.unwrap();

    // Another writer changes the half this instance does not own.
    backing.entry(3).or_default().1 = "external".to_string();

    sleep(Duration::from_millis(1_500)).await;
    let value = cache.read_for(3, Duration::from_secs(1)).await.unwrap();
    assert_eq!(value.1, "external");
}

#[tokio::test(start_paused = true)]
async fn test_reads_blocked_during_resync_without_out_of_order() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing);
    adapter.set_refresh_delay(Duration::from_millis(500));
    let (cache, _) = started_cache(test_config("strict"), adapter);

    cache.preload(4).await.unwrap();
    cache.read_for(4, Duration::from_secs(1)).await.unwrap();

    // Land in the middle of the in-flight refresh.
    sleep(Duration::from_millis(1_100)).await;
    let err = cache
        .read_for(4, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotLoaded);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_reads_served_during_resync() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    backing.insert(4, ("v".to_string(), String::new()));
    let adapter = SignalAdapter::new(Half::Hi, backing);
    adapter.set_refresh_delay(Duration::from_millis(500));
    let mut config = test_config("loose");
    config.accept_out_of_order_reads = true;
    let (cache, _) = started_cache(config, adapter);

    cache.preload(4).await.unwrap();
    cache.read_for(4, Duration::from_secs(1)).await.unwrap();

    sleep(Duration::from_millis(1_100)).await;
    let value = cache
        .read_for(4, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(value.0, "v");
}

#[tokio::test(start_paused = true)]
async fn test_updates_persist_in_submission_order_across_cycles() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing.clone());
    let (cache, _) = started_cache(test_config("order"), adapter.clone());

    cache.preload(8).await.unwrap();
    cache.read_for(8, Duration::from_secs(1)).await.unwrap();

    cache.write_if_cached(8, 'a').unwrap();
    cache.write_if_cached(8, 'b').unwrap();
    sleep(Duration::from_millis(1_100)).await;

    // Updates collected during the post-write dwell carry into another
    // full cycle instead of being lost.
    cache.write_if_cached(8, 'c').unwrap();
    sleep(Duration::from_millis(1_400)).await;
    cache.write_if_cached(8, 'd').unwrap();
    cache.write_if_cached(8, 'e').unwrap();
    sleep(Duration::from_millis(2_500)).await;

    assert_eq!(backing.get(&8).unwrap().0, "abcde");
    adapter.assert_no_overlapping_storage_calls();
}

#[tokio::test(start_paused = true)]
async fn test_stale_reads_after_permanent_resync_failure() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    backing.insert(6, ("old".to_string(), String::new()));
    let adapter = SignalAdapter::new(Half::Hi, backing);

    let mut config = test_config("stale");
    config.resync_failed_final_action = ResyncFailedFinalAction::KeepCollectingUpdates;
    config.allow_data_reading_after_resync_failed_final = true;
    let (cache, recorder) = started_cache(config, adapter.clone());

    cache.preload(6).await.unwrap();
    cache.read_for(6, Duration::from_secs(1)).await.unwrap();
    // Every refresh from here on fails until its retry budget is exhausted.
    adapter.fail_next_reads(vec![StorageError::Transient("down".into()); 100]);

    sleep(Duration::from_millis(1_500)).await;
    assert!(recorder.count("storage_resync_fail_final") >= 1);

    let value = cache.read_for(6, Duration::from_secs(1)).await.unwrap();
    assert_eq!(value.0, "old");
    assert!(cache.status(Duration::ZERO).stale_reads_served >= 1);
    assert!(recorder.count("stale_value_served") >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_resync_failure_blocks_reads_when_disallowed() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    backing.insert(6, ("old".to_string(), String::new()));
    let adapter = SignalAdapter::new(Half::Hi, backing);

    let mut config = test_config("stale-strict");
    config.resync_failed_final_action = ResyncFailedFinalAction::KeepCollectingUpdates;
    config.allow_data_reading_after_resync_failed_final = false;
    let (cache, _) = started_cache(config, adapter.clone());

    cache.preload(6).await.unwrap();
    cache.read_for(6, Duration::from_secs(1)).await.unwrap();
    adapter.fail_next_reads(vec![StorageError::Transient("down".into()); 100]);

    sleep(Duration::from_millis(1_500)).await;
    let err = cache.read_for(6, Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(err, CacheError::ResyncFailedFinal);
}

#[tokio::test(start_paused = true)]
async fn test_initial_read_failure_is_surfaced() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing);
    adapter.fail_next_reads(vec![StorageError::Permanent("no such table".into())]);

    let (cache, recorder) = started_cache(test_config("dead"), adapter);
    cache.preload(2).await.unwrap();
    let err = cache.read_for(2, Duration::from_secs(5)).await.unwrap_err();
    assert_eq!(err, CacheError::ReadFailedFinal);
    assert_eq!(recorder.count("storage_read_fail_final"), 1);

    // With the default removal policy the entry is gone again.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_update_log_overflow_during_slow_resync() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing.clone());
    adapter.set_refresh_delay(Duration::from_millis(800));

    let mut config = test_config("overflow");
    config.max_updates_to_collect = 2;
    let (cache, recorder) = started_cache(config, adapter);

    cache.preload(11).await.unwrap();
    cache.read_for(11, Duration::from_secs(1)).await.unwrap();

    // The refresh is in flight from the first cycle boundary; pile up more
    // updates than the log bound allows while it runs.
    sleep(Duration::from_millis(1_100)).await;
    cache.write_if_cached(11, 'x').unwrap();
    cache.write_if_cached(11, 'y').unwrap();
    cache.write_if_cached(11, 'z').unwrap();

    sleep(Duration::from_millis(1_200)).await;
    assert_eq!(recorder.count("update_log_overflow"), 1);
    assert!(recorder.count("resync_too_late") >= 1);

    // The default too-late policy keeps the in-memory value, so the updates
    // still reach storage on the following cycle.
    sleep(Duration::from_millis(1_500)).await;
    assert_eq!(backing.get(&11).unwrap().0, "xyz");
}

#[tokio::test(start_paused = true)]
async fn test_status_snapshot_is_cached_for_ttl() {
    init_tracing();
    let backing: Backing = Arc::new(DashMap::new());
    let adapter = SignalAdapter::new(Half::Hi, backing);
    let (cache, _) = started_cache(test_config("status"), adapter);

    let before = cache.status(Duration::from_secs(5));
    assert_eq!(before.entries_created, 0);

    cache.preload(1).await.unwrap();
    let cached = cache.status(Duration::from_secs(5));
    assert_eq!(cached.entries_created, 0);

    sleep(Duration::from_secs(6)).await;
    let fresh = cache.status(Duration::from_secs(5));
    assert_eq!(fresh.entries_created, 1);
}
