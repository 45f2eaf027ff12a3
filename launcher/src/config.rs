use std::path::PathBuf;
use std::time::Duration;

use shared_types::env::env_parse;

use crate::supervisor::SupervisorConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the worker binary
    pub worker_binary: PathBuf,
    /// Path to the desktop shell binary
    pub ui_binary: PathBuf,
    pub supervisor: SupervisorConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            // Default: next to the launcher executable. Override with
            // MODKEEPER_WORKER_BINARY / MODKEEPER_UI_BINARY.
            worker_binary: env_binary("MODKEEPER_WORKER_BINARY", "modkeeper-worker")?,
            ui_binary: env_binary("MODKEEPER_UI_BINARY", "modkeeper-desktop")?,
            supervisor: SupervisorConfig {
                max_worker_restarts: env_parse("MODKEEPER_MAX_WORKER_RESTARTS", 3)?,
                monitor_interval: Duration::from_millis(env_parse(
                    "MODKEEPER_MONITOR_INTERVAL_MS",
                    1000,
                )?),
                restart_delay: Duration::from_millis(env_parse(
                    "MODKEEPER_RESTART_DELAY_MS",
                    1000,
                )?),
                shutdown_grace: Duration::from_secs(env_parse(
                    "MODKEEPER_SHUTDOWN_GRACE_SECS",
                    5,
                )?),
            },
        })
    }
}

fn env_binary(key: &str, name: &str) -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os(key) {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("Cannot locate launcher executable: {e}"))?;
    Ok(exe.with_file_name(format!("{name}{}", std::env::consts::EXE_SUFFIX)))
}
