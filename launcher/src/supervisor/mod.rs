//! Child process supervisor.
//!
//! Owns the worker and UI processes: starts them with the shared rendezvous
//! port, restarts the worker when it crashes and tears everything down when
//! the UI goes away.

pub mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shared_types::launch::SHUTDOWN_COMMAND;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use process::{BinaryLauncher, ChildProcess, ProcessLauncher};

/// Which child a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRole {
    /// Hosts the message bus, stats and install pipeline.
    Worker,
    /// The desktop shell.
    Ui,
}

impl std::fmt::Display for ChildRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildRole::Worker => write!(f, "worker"),
            ChildRole::Ui => write!(f, "ui"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    /// Exited on its own; carries the exit code when there was one.
    Exited(Option<i32>),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UiExited,
    WorkerRestartsExhausted,
    StartupFailed,
    Requested,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UiExited => write!(f, "ui exited"),
            ShutdownReason::WorkerRestartsExhausted => write!(f, "worker restarts exhausted"),
            ShutdownReason::StartupFailed => write!(f, "startup failed"),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
        }
    }
}

/// Result of one monitor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Continue,
    Shutdown(ShutdownReason),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Worker relaunches allowed before giving up.
    pub max_worker_restarts: u32,
    pub monitor_interval: Duration,
    /// Pause before relaunching a crashed worker.
    pub restart_delay: Duration,
    /// How long each child gets to exit before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_worker_restarts: 3,
            monitor_interval: Duration::from_secs(1),
            restart_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Reserve a free loopback port for the bus.
///
/// The listener is dropped right away so the worker can bind the port.
pub fn pick_rendezvous_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

struct ChildRecord {
    child: Option<Box<dyn ChildProcess>>,
    pid: Option<u32>,
    status: ChildStatus,
    started_at: Instant,
    restarts: u32,
}

impl ChildRecord {
    fn running(child: Box<dyn ChildProcess>, restarts: u32) -> Self {
        Self {
            pid: child.pid(),
            child: Some(child),
            status: ChildStatus::Running,
            started_at: Instant::now(),
            restarts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChildSnapshot {
    pub role: ChildRole,
    pub pid: Option<u32>,
    pub status: ChildStatus,
    pub uptime: Duration,
    pub restarts: u32,
}

pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    port: u16,
    children: Mutex<HashMap<ChildRole, ChildRecord>>,
    shutdown_started: AtomicBool,
    shutdown_done: CancellationToken,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, launcher: Arc<dyn ProcessLauncher>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            port,
            children: Mutex::new(HashMap::new()),
            shutdown_started: AtomicBool::new(false),
            shutdown_done: CancellationToken::new(),
        })
    }

    /// Launch the worker, then the UI. If either fails, whatever already
    /// started is shut down and the error returned.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        for role in [ChildRole::Worker, ChildRole::Ui] {
            match self.launcher.launch(role, self.port).await {
                Ok(child) => {
                    let record = ChildRecord::running(child, 0);
                    info!(%role, pid = ?record.pid, port = self.port, "child started");
                    self.children.lock().await.insert(role, record);
                }
                Err(e) => {
                    error!(%role, "failed to start child: {e:#}");
                    self.shutdown(ShutdownReason::StartupFailed).await;
                    return Err(e.context(format!("starting {role}")));
                }
            }
        }
        Ok(())
    }

    /// One monitor pass: check for exits and relaunch the worker if allowed.
    pub async fn tick(self: &Arc<Self>) -> MonitorAction {
        if self.is_shutting_down() {
            return MonitorAction::Shutdown(ShutdownReason::Requested);
        }

        let restarts = {
            let mut children = self.children.lock().await;

            if let Some(code) = poll_exit(&mut children, ChildRole::Ui) {
                info!(?code, "ui exited");
                return MonitorAction::Shutdown(ShutdownReason::UiExited);
            }

            match poll_exit(&mut children, ChildRole::Worker) {
                None => return MonitorAction::Continue,
                Some(code) => {
                    let restarts = children
                        .get(&ChildRole::Worker)
                        .map(|record| record.restarts)
                        .unwrap_or(0);
                    if restarts >= self.config.max_worker_restarts {
                        error!(?code, restarts, "worker exited and restarts are exhausted");
                        return MonitorAction::Shutdown(ShutdownReason::WorkerRestartsExhausted);
                    }
                    warn!(?code, restarts, "worker exited; restarting");
                    restarts
                }
            }
        };

        // The lock is released while waiting so snapshot() and shutdown() keep working.
        sleep(self.config.restart_delay).await;

        match self.launcher.launch(ChildRole::Worker, self.port).await {
            Ok(mut child) => {
                if self.is_shutting_down() {
                    warn!("shutdown started during worker restart; stopping the new worker");
                    stop_child(ChildRole::Worker, child.as_mut(), self.config.shutdown_grace).await;
                    return MonitorAction::Shutdown(ShutdownReason::Requested);
                }
                let record = ChildRecord::running(child, restarts + 1);
                info!(pid = ?record.pid, restarts = record.restarts, "worker restarted");
                self.children.lock().await.insert(ChildRole::Worker, record);
                MonitorAction::Continue
            }
            Err(e) => {
                error!("worker relaunch failed: {e:#}");
                let mut children = self.children.lock().await;
                if let Some(record) = children.get_mut(&ChildRole::Worker) {
                    // A failed relaunch still counts against the budget.
                    record.restarts = restarts + 1;
                }
                MonitorAction::Continue
            }
        }
    }

    /// Run the monitor loop until a shutdown condition or `cancel` fires.
    /// Always leaves every child stopped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> ShutdownReason {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ShutdownReason::Requested,
                _ = self.shutdown_done.cancelled() => break ShutdownReason::Requested,
                _ = interval.tick() => {
                    if let MonitorAction::Shutdown(reason) = self.tick().await {
                        break reason;
                    }
                }
            }
        };

        self.shutdown(reason).await;
        reason
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_started.load(Ordering::SeqCst)
    }

    /// Stop every child. Only the first caller does the work; later callers
    /// wait until it has finished.
    pub async fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.shutdown_done.cancelled().await;
            return;
        }
        info!(%reason, "shutting down children");

        // UI first so it stops talking to the bus before the worker goes.
        for role in [ChildRole::Ui, ChildRole::Worker] {
            let child = {
                let mut children = self.children.lock().await;
                children.get_mut(&role).and_then(|record| {
                    let child = record.child.take();
                    if child.is_some() {
                        record.status = ChildStatus::Stopped;
                    }
                    child
                })
            };
            if let Some(mut child) = child {
                stop_child(role, child.as_mut(), self.config.shutdown_grace).await;
            }
        }

        info!("all children stopped");
        self.shutdown_done.cancel();
    }

    pub async fn snapshot(&self) -> Vec<ChildSnapshot> {
        let children = self.children.lock().await;
        let mut out: Vec<_> = children
            .iter()
            .map(|(role, record)| ChildSnapshot {
                role: *role,
                pid: record.pid,
                status: record.status.clone(),
                uptime: record.started_at.elapsed(),
                restarts: record.restarts,
            })
            .collect();
        out.sort_by_key(|snapshot| snapshot.role == ChildRole::Ui);
        out
    }
}

/// Returns the exit code if `role` is down and not deliberately stopped.
///
/// A record left without a child by a failed relaunch keeps reporting its
/// last exit so the next pass retries or gives up.
fn poll_exit(children: &mut HashMap<ChildRole, ChildRecord>, role: ChildRole) -> Option<Option<i32>> {
    let record = children.get_mut(&role)?;
    let Some(child) = record.child.as_mut() else {
        return match record.status {
            ChildStatus::Exited(code) => Some(code),
            _ => None,
        };
    };
    let code = match child.try_exit() {
        Ok(Some(code)) => code,
        Ok(None) => return None,
        Err(e) => {
            warn!(%role, "failed to poll child status: {e}");
            return None;
        }
    };
    record.child = None;
    record.status = ChildStatus::Exited(code);
    Some(code)
}

async fn stop_child(role: ChildRole, child: &mut dyn ChildProcess, grace: Duration) {
    if let Ok(Some(code)) = child.try_exit() {
        info!(%role, ?code, "child already exited");
        return;
    }

    if role == ChildRole::Worker {
        if let Err(e) = child.send_line(SHUTDOWN_COMMAND).await {
            warn!(%role, "failed to send shutdown command: {e}");
        }
    }
    if let Err(e) = child.request_close() {
        warn!(%role, "failed to request close: {e}");
    }

    match child.wait_timeout(grace).await {
        Ok(true) => info!(%role, "child stopped"),
        Ok(false) => {
            warn!(%role, grace_secs = grace.as_secs(), "child did not exit in time; killing");
            if let Err(e) = child.kill().await {
                error!(%role, "failed to kill child: {e}");
            }
        }
        Err(e) => {
            warn!(%role, "error waiting for child: {e}; killing");
            child.kill().await.ok();
        }
    }
}
