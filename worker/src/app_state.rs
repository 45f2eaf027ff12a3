//! Wiring for one running worker: settings, persistence, bus, pipeline and
//! the downloads watcher, all sharing one cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusServer, InboundMessage};
use crate::config::Config;
use crate::downloads::DownloadsWatcher;
use crate::persistence::{PersistenceEngine, SqliteStatsStore};
use crate::pipeline::installer::CopyInstaller;
use crate::pipeline::{FileEventPipeline, PipelineEvent};
use crate::settings::{Settings, SettingsStore};

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const PIPELINE_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    settings: Arc<SettingsStore>,
    persistence: PersistenceEngine,
    bus: BusServer,
    pipeline: Arc<FileEventPipeline>,
    bus_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Start every worker component. A bus bind failure is returned as an
    /// error; callers treat it as fatal.
    pub async fn start(config: Config, port: u16, cancel: CancellationToken) -> anyhow::Result<Self> {
        let settings = SettingsStore::load(&config.settings_path, Settings::rooted_at(&config.data_dir))
            .with_context(|| format!("loading settings from {}", config.settings_path.display()))?;
        let current = settings.snapshot();

        let persistence = PersistenceEngine::start(
            config.persistence(),
            Arc::new(SqliteStatsStore::new(&config.database_path)),
            cancel.clone(),
        );

        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_CHANNEL_CAPACITY);
        let bus = BusServer::new(Arc::clone(&settings), inbound_tx, cancel.clone());
        let bus_addr = bus
            .start(port)
            .await
            .context("starting message bus server")?;

        let pipeline = Arc::new(
            FileEventPipeline::new(
                Arc::new(bus.clone()),
                Arc::clone(&settings),
                Arc::new(CopyInstaller::new(&current.mods_dir)),
                Arc::new(persistence.clone()),
            )
            .with_selection_timeout(config.selection_timeout),
        );

        let (events_tx, events_rx) = mpsc::channel::<PipelineEvent>(PIPELINE_CHANNEL_CAPACITY);
        let mut tasks = vec![
            tokio::spawn(Arc::clone(&pipeline).run(events_rx, cancel.clone())),
            tokio::spawn(bus.clone().run_config_forwarder(settings.subscribe())),
            tokio::spawn(forward_inbound(inbound_rx, events_tx.clone(), cancel.clone())),
        ];

        let watcher = DownloadsWatcher::new(&current.downloads_dir, &current.staging_dir)
            .with_settle_delay(config.settle_delay);
        match watcher.spawn(events_tx, cancel.clone()) {
            Ok(task) => tasks.push(task),
            // The bus and stats stay useful without the watcher.
            Err(e) => tracing::error!(error = %e, "Downloads watcher unavailable"),
        }

        tracing::info!(%bus_addr, data_dir = %config.data_dir.display(), "Worker started");
        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                settings,
                persistence,
                bus,
                pipeline,
                bus_addr,
                cancel,
                tasks: std::sync::Mutex::new(tasks),
            }),
        })
    }

    pub fn settings(&self) -> Arc<SettingsStore> {
        Arc::clone(&self.inner.settings)
    }

    pub fn persistence(&self) -> PersistenceEngine {
        self.inner.persistence.clone()
    }

    pub fn bus(&self) -> BusServer {
        self.inner.bus.clone()
    }

    pub fn pipeline(&self) -> Arc<FileEventPipeline> {
        Arc::clone(&self.inner.pipeline)
    }

    pub fn bus_addr(&self) -> SocketAddr {
        self.inner.bus_addr
    }

    /// Flush stats, then stop every loop.
    pub async fn shutdown(&self) {
        tracing::info!("Worker shutting down");
        if !self
            .inner
            .persistence
            .flush_and_wait(self.inner.config.flush_timeout)
            .await
        {
            tracing::warn!(
                pending = self.inner.persistence.pending(),
                "Shutting down with unflushed stats"
            );
        }

        self.inner.cancel.cancel();
        self.inner.persistence.shutdown().await;

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Worker stopped");
    }
}

async fn forward_inbound(
    mut inbound: mpsc::Receiver<InboundMessage>,
    events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => {
                    if events.send(PipelineEvent::Bus(message)).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}
