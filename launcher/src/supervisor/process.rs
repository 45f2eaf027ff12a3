//! Child process handles.
//!
//! The supervisor only talks to [`ChildProcess`] and [`ProcessLauncher`], so
//! tests can drive it with in-memory fakes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use shared_types::launch::SUPERVISED_ENV;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error};

use super::ChildRole;

#[async_trait]
pub trait ChildProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// `Some(exit code)` once the process has exited. The code is `None`
    /// when it was killed by a signal.
    fn try_exit(&mut self) -> std::io::Result<Option<Option<i32>>>;

    /// Write one line to the child's stdin.
    async fn send_line(&mut self, line: &str) -> std::io::Result<()>;

    /// Ask the child to close (SIGTERM on Unix).
    fn request_close(&mut self) -> std::io::Result<()>;

    /// True if the child exited within `timeout`.
    async fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<bool>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, role: ChildRole, port: u16) -> anyhow::Result<Box<dyn ChildProcess>>;
}

/// Launches the real worker and UI binaries.
pub struct BinaryLauncher {
    worker_binary: PathBuf,
    ui_binary: PathBuf,
}

impl BinaryLauncher {
    pub fn new(worker_binary: PathBuf, ui_binary: PathBuf) -> Self {
        Self {
            worker_binary,
            ui_binary,
        }
    }

    fn binary_for(&self, role: ChildRole) -> &PathBuf {
        match role {
            ChildRole::Worker => &self.worker_binary,
            ChildRole::Ui => &self.ui_binary,
        }
    }
}

#[async_trait]
impl ProcessLauncher for BinaryLauncher {
    async fn launch(&self, role: ChildRole, port: u16) -> anyhow::Result<Box<dyn ChildProcess>> {
        let binary = self.binary_for(role);
        let mut command = Command::new(binary);
        command
            .arg(port.to_string())
            .env(SUPERVISED_ENV, "1")
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        match role {
            // Shutdown requests arrive on the worker's stdin.
            ChildRole::Worker => command.stdin(Stdio::piped()),
            // The UI prompts on the terminal.
            ChildRole::Ui => command.stdin(Stdio::inherit()),
        };

        let mut child = command.spawn().map_err(|e| {
            error!(%role, port, binary = %binary.display(), "failed to spawn child: {e}");
            anyhow::anyhow!("failed to spawn {role} from {}: {e}", binary.display())
        })?;
        let stdin = child.stdin.take();

        Ok(Box::new(OsChild { child, stdin }))
    }
}

struct OsChild {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> std::io::Result<Option<Option<i32>>> {
        Ok(self.child.try_wait()?.map(|status| status.code()))
    }

    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stdin is not piped",
            ));
        };
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await
    }

    fn request_close(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SAFETY: plain signal delivery to a child we own.
                let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if rc != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            debug!("no graceful close signal on this platform; waiting for exit");
            Ok(())
        }
    }

    async fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<bool> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "child exited");
                Ok(true)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}
