//! Persistence engine integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use worker::persistence::retry::RetryPolicy;
use worker::persistence::store::{CommitBatch, InstallEvent, StatsBackend, StoreError};
use worker::persistence::{
    InstallRecorder, PersistenceConfig, PersistenceEngine, SqliteStatsStore, STAT_MODS_INSTALLED,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

fn sqlite_engine(config: PersistenceConfig) -> (tempfile::TempDir, PersistenceEngine) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let store = SqliteStatsStore::new(dir.path().join("stats.db"));
    let engine = PersistenceEngine::start(config, Arc::new(store), CancellationToken::new());
    (dir, engine)
}

/// Backend whose commits always fail.
#[derive(Default)]
struct FailingBackend {
    commits: AtomicUsize,
}

impl StatsBackend for FailingBackend {
    fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn commit(&self, _batch: &CommitBatch) -> Result<(), StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Database("disk I/O error".to_string()))
    }

    fn get_count(&self, _key: &str) -> Result<i64, StoreError> {
        Ok(0)
    }

    fn recent_events(&self, _limit: usize) -> Result<Vec<InstallEvent>, StoreError> {
        Ok(Vec::new())
    }
}

/// Backend that cannot even be opened.
struct BrokenBackend;

impl StatsBackend for BrokenBackend {
    fn initialize(&self) -> Result<(), StoreError> {
        Err(StoreError::Database("unable to open database file".to_string()))
    }

    fn commit(&self, _batch: &CommitBatch) -> Result<(), StoreError> {
        unreachable!("commit on uninitialized store")
    }

    fn get_count(&self, _key: &str) -> Result<i64, StoreError> {
        unreachable!("read on uninitialized store")
    }

    fn recent_events(&self, _limit: usize) -> Result<Vec<InstallEvent>, StoreError> {
        unreachable!("read on uninitialized store")
    }
}

#[tokio::test]
async fn test_increments_are_counted_after_flush() {
    let (_dir, engine) = sqlite_engine(PersistenceConfig::production());

    for _ in 0..7 {
        engine.increment_stat(STAT_MODS_INSTALLED).await;
    }

    assert!(engine.flush_and_wait(FLUSH_TIMEOUT).await);
    assert_eq!(engine.get_count(STAT_MODS_INSTALLED).await, 7);
    assert_eq!(engine.pending(), 0);
}

#[tokio::test]
async fn test_commit_invalidates_cached_key() {
    let (_dir, engine) = sqlite_engine(PersistenceConfig::interactive());
    let engine_ref = &engine;

    assert_eq!(engine.get_count("ArchivesSeen").await, 0);
    engine.increment_stat("ArchivesSeen").await;

    tokio::time::timeout(FLUSH_TIMEOUT, async {
        while engine_ref.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Commit did not finish");

    // No flush: only the per-key invalidation makes the new value visible.
    assert_eq!(engine.get_count("ArchivesSeen").await, 1);
}

#[tokio::test]
async fn test_failed_batch_is_retried_three_times_then_dropped() {
    let backend = Arc::new(FailingBackend::default());
    let config = PersistenceConfig::interactive()
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1)));
    let engine = PersistenceEngine::start(config, backend.clone(), CancellationToken::new());

    engine.increment_stat(STAT_MODS_INSTALLED).await;

    assert!(engine.flush_and_wait(FLUSH_TIMEOUT).await);
    assert_eq!(backend.commits.load(Ordering::SeqCst), 4);
    assert_eq!(engine.dead_letters(), 1);
    assert_eq!(engine.get_count(STAT_MODS_INSTALLED).await, 0);
}

#[tokio::test]
async fn test_init_failure_returns_safe_defaults() {
    let engine = PersistenceEngine::start(
        PersistenceConfig::interactive(),
        Arc::new(BrokenBackend),
        CancellationToken::new(),
    );

    engine.increment_stat(STAT_MODS_INSTALLED).await;
    engine.record_event("cool-mod.pak", json!({})).await;

    assert_eq!(engine.get_count(STAT_MODS_INSTALLED).await, 0);
    assert!(engine.recent_events(10).await.is_empty());
    assert!(engine.flush_and_wait(FLUSH_TIMEOUT).await);
    assert_eq!(engine.pending(), 0);
}

#[tokio::test]
async fn test_record_install_writes_stat_and_event() {
    let (_dir, engine) = sqlite_engine(PersistenceConfig::production());

    engine
        .record_install("first.pak", json!({"archive": "pack.zip"}))
        .await;
    engine
        .record_install("second.pak", json!({"archive": "pack.zip"}))
        .await;

    assert!(engine.flush_and_wait(FLUSH_TIMEOUT).await);
    assert_eq!(engine.get_count(STAT_MODS_INSTALLED).await, 2);

    let events = engine.recent_events(10).await;
    let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["second.pak", "first.pak"]);
    assert_eq!(events[0].payload["archive"], "pack.zip");
}

#[tokio::test]
async fn test_shutdown_commits_partial_batch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.db");
    let config = PersistenceConfig {
        batch_size: 50,
        batch_max_age: Duration::from_secs(60),
        ..PersistenceConfig::production()
    };
    let engine = PersistenceEngine::start(
        config,
        Arc::new(SqliteStatsStore::new(&path)),
        CancellationToken::new(),
    );

    for _ in 0..3 {
        engine.increment_stat("ArchivesSeen").await;
    }
    engine.shutdown().await;

    let reopened = SqliteStatsStore::new(&path);
    assert_eq!(reopened.get_count("ArchivesSeen").unwrap(), 3);
}
