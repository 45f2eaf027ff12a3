//! Persistence engine - buffered, batched and retried stats writes
//!
//! # Architecture
//!
//! ```text
//! increment_stat / record_event
//!         │  (bounded queue, producers wait when full)
//!         ▼
//!   batch consumer ── size or age trigger ──► StoreGateActor ──► SQLite
//!         ▲                                        │
//!         └──── re-queue with backoff on failure ◄─┘
//! ```
//!
//! - A single consumer drains the queue and commits batches of summed
//!   increments in one transaction.
//! - Failed batches are split back into operations and re-queued with
//!   exponential backoff; after the retry limit an operation is dropped and
//!   counted as a dead letter.
//! - Reads go through a TTL cache that is invalidated per key on commit and
//!   cleared entirely by [`PersistenceEngine::flush_and_wait`].
//! - Until the store gate has started, callers wait on a readiness signal. If
//!   initialization failed, reads return zero and writes are discarded.

pub mod cache;
pub mod gate;
pub mod retry;
pub mod store;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorRef};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::cache::StatCache;
use self::gate::{StoreGateActor, StoreGateArguments, StoreGateMsg};
use self::retry::{RetryDecision, RetryPolicy};
use self::store::{CommitBatch, InstallEvent, StatsBackend};

pub use self::store::SqliteStatsStore;

/// Counter bumped once per installed file.
pub const STAT_MODS_INSTALLED: &str = "ModsInstalled";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_max_age: Duration,
    pub cache_ttl: Duration,
    pub retry: RetryPolicy,
    pub flush_poll_interval: Duration,
}

impl PersistenceConfig {
    /// Throughput-oriented defaults.
    pub fn production() -> Self {
        Self {
            queue_capacity: 1000,
            batch_size: 50,
            batch_max_age: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            flush_poll_interval: Duration::from_millis(10),
        }
    }

    /// Commit every operation immediately.
    pub fn interactive() -> Self {
        Self {
            batch_size: 1,
            batch_max_age: Duration::ZERO,
            cache_ttl: Duration::from_secs(1),
            ..Self::production()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self::production()
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    IncrementStat,
    RecordEvent { payload: serde_json::Value },
}

/// A unit of pending work in the write queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseOperation {
    pub kind: OperationKind,
    /// Stat key or event name.
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

impl DatabaseOperation {
    pub fn increment(key: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::IncrementStat,
            key: key.into(),
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn event(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: OperationKind::RecordEvent { payload },
            key: name.into(),
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Sink for completed installations; lets the pipeline run without a database.
#[async_trait]
pub trait InstallRecorder: Send + Sync {
    async fn record_install(&self, name: &str, payload: serde_json::Value);
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Clone)]
enum Readiness {
    Starting,
    Ready(ActorRef<StoreGateMsg>),
    Failed(String),
}

#[derive(Clone)]
pub struct PersistenceEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: PersistenceConfig,
    queue: mpsc::Sender<DatabaseOperation>,
    ready: watch::Receiver<Readiness>,
    pending: AtomicUsize,
    dead_letters: AtomicU64,
    cache: StatCache,
    init_failure_logged: AtomicBool,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceEngine {
    /// Spawn the store gate and the batch consumer.
    ///
    /// Returns immediately; the gate initializes in the background.
    pub fn start(
        config: PersistenceConfig,
        backend: Arc<dyn StatsBackend>,
        cancel: CancellationToken,
    ) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (ready_tx, ready) = watch::channel(Readiness::Starting);

        let engine = Self {
            inner: Arc::new(EngineInner {
                cache: StatCache::new(config.cache_ttl),
                config,
                queue,
                ready,
                pending: AtomicUsize::new(0),
                dead_letters: AtomicU64::new(0),
                init_failure_logged: AtomicBool::new(false),
                cancel: cancel.child_token(),
                consumer: Mutex::new(None),
            }),
        };

        tokio::spawn(async move {
            let state = match Actor::spawn(None, StoreGateActor, StoreGateArguments { backend }).await
            {
                Ok((gate, _handle)) => {
                    tracing::info!("Stats store ready");
                    Readiness::Ready(gate)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Stats store failed to initialize");
                    Readiness::Failed(e.to_string())
                }
            };
            let _ = ready_tx.send(state);
        });

        let consumer = tokio::spawn(engine.clone().run_consumer(rx));
        if let Ok(mut slot) = engine.inner.consumer.try_lock() {
            *slot = Some(consumer);
        }
        engine
    }

    pub async fn increment_stat(&self, key: &str) {
        self.enqueue(DatabaseOperation::increment(key)).await;
    }

    pub async fn record_event(&self, name: &str, payload: serde_json::Value) {
        self.enqueue(DatabaseOperation::event(name, payload)).await;
    }

    /// Current value of `key`; 0 when unknown or the store is unavailable.
    pub async fn get_count(&self, key: &str) -> i64 {
        if let Some(value) = self.inner.cache.get(key) {
            return value;
        }
        let Some(gate) = self.gate().await else {
            return 0;
        };
        match gate::get_count(&gate, key).await {
            Ok(value) => {
                self.inner.cache.put(key, value);
                value
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Stat read failed");
                0
            }
        }
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<InstallEvent> {
        let Some(gate) = self.gate().await else {
            return Vec::new();
        };
        gate::recent_events(&gate, limit)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Event read failed");
                Vec::new()
            })
    }

    /// Wait until every accepted operation is committed or dropped, up to
    /// `timeout`, then clear the read cache. Returns false on timeout.
    pub async fn flush_and_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let drained = loop {
            let pending = self.pending();
            if pending == 0 {
                break true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(pending, "Flush timed out with operations still pending");
                break false;
            }
            tokio::time::sleep(self.inner.config.flush_poll_interval).await;
        };
        self.inner.cache.invalidate_all();
        drained
    }

    /// Stop the consumer after it commits what is queued, then stop the gate.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(consumer) = self.inner.consumer.lock().await.take() {
            if let Err(e) = consumer.await {
                tracing::warn!(error = %e, "Persistence consumer ended abnormally");
            }
        }
        if let Readiness::Ready(gate) = &*self.inner.ready.borrow() {
            gate.stop(None);
        }
    }

    /// Operations accepted but not yet committed or dropped.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Operations dropped after exhausting their retries.
    pub fn dead_letters(&self) -> u64 {
        self.inner.dead_letters.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Option<ActorRef<StoreGateMsg>> {
        let mut ready = self.inner.ready.clone();
        let waited = ready
            .wait_for(|state| !matches!(state, Readiness::Starting))
            .await
            .map(|state| state.clone());
        let state = match waited {
            Ok(state) => state,
            Err(_) => ready.borrow().clone(),
        };

        match state {
            Readiness::Ready(gate) => Some(gate),
            Readiness::Failed(reason) => {
                if !self.inner.init_failure_logged.swap(true, Ordering::SeqCst) {
                    tracing::error!(%reason, "Stats store unavailable; stats calls are no-ops");
                }
                None
            }
            Readiness::Starting => None,
        }
    }

    async fn enqueue(&self, op: DatabaseOperation) {
        if self.gate().await.is_none() {
            return;
        }
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.inner.queue.send(op).await.is_err() {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Persistence queue closed; operation discarded");
        }
    }

    async fn run_consumer(self, mut rx: mpsc::Receiver<DatabaseOperation>) {
        let Some(gate) = self.gate().await else {
            return;
        };

        let batch_size = self.inner.config.batch_size.max(1);
        let max_age = self.inner.config.batch_max_age;
        let mut batch: Vec<DatabaseOperation> = Vec::with_capacity(batch_size);
        let mut opened_at: Option<Instant> = None;

        loop {
            let deadline = opened_at.map(|opened| opened + max_age);
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => {
                    while let Ok(op) = rx.try_recv() {
                        batch.push(op);
                    }
                    if !batch.is_empty() {
                        self.commit(&gate, std::mem::take(&mut batch)).await;
                    }
                    break;
                }
                op = rx.recv() => match op {
                    Some(op) => {
                        let opened = *opened_at.get_or_insert_with(Instant::now);
                        batch.push(op);
                        if batch.len() >= batch_size || opened.elapsed() >= max_age {
                            self.commit(&gate, std::mem::take(&mut batch)).await;
                            opened_at = None;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            self.commit(&gate, std::mem::take(&mut batch)).await;
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.commit(&gate, std::mem::take(&mut batch)).await;
                    opened_at = None;
                }
            }
        }
        tracing::debug!("Persistence consumer stopped");
    }

    async fn commit(&self, gate: &ActorRef<StoreGateMsg>, operations: Vec<DatabaseOperation>) {
        if operations.is_empty() {
            return;
        }
        let batch = CommitBatch::from_operations(&operations);
        match gate::commit(gate, batch.clone()).await {
            Ok(()) => {
                for key in batch.stat_keys() {
                    self.inner.cache.invalidate(key);
                }
                self.inner
                    .pending
                    .fetch_sub(operations.len(), Ordering::SeqCst);
                tracing::trace!(operations = operations.len(), "Committed batch");
            }
            Err(e) => {
                tracing::warn!(operations = operations.len(), error = %e, "Batch commit failed");
                for op in operations {
                    self.retry_or_drop(op);
                }
            }
        }
    }

    fn retry_or_drop(&self, mut op: DatabaseOperation) {
        match self.inner.config.retry.decide(op.retry_count) {
            RetryDecision::Retry { attempt, delay } => {
                op.retry_count = attempt;
                tracing::debug!(key = %op.key, attempt, ?delay, "Re-queueing operation");
                let engine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if engine.inner.queue.send(op).await.is_err() {
                        engine.inner.pending.fetch_sub(1, Ordering::SeqCst);
                        engine.inner.dead_letters.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            RetryDecision::GiveUp => {
                tracing::error!(
                    key = %op.key,
                    retries = op.retry_count,
                    "Operation failed permanently; dropping"
                );
                self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                self.inner.dead_letters.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl InstallRecorder for PersistenceEngine {
    async fn record_install(&self, name: &str, payload: serde_json::Value) {
        self.increment_stat(STAT_MODS_INSTALLED).await;
        self.record_event(name, payload).await;
    }
}
