use std::path::PathBuf;
use std::time::Duration;

use shared_types::env::env_parse;

use crate::persistence::PersistenceConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root for settings, the stats database and default folders
    pub data_dir: PathBuf,
    /// Path to the stats SQLite database
    pub database_path: PathBuf,
    /// Path to the TOML settings file
    pub settings_path: PathBuf,
    /// Commit every stat immediately instead of batching.
    pub interactive: bool,
    /// How long a `select_files` request waits for the UI.
    pub selection_timeout: Duration,
    /// Upper bound on the persistence flush during shutdown.
    pub flush_timeout: Duration,
    /// Quiet period before a new download is extracted.
    pub settle_delay: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let data_dir = PathBuf::from(env_str("MODKEEPER_DATA_DIR", "./data"));
        Ok(Self {
            database_path: env_path("MODKEEPER_DATABASE_PATH", data_dir.join("stats.db")),
            settings_path: env_path("MODKEEPER_SETTINGS_PATH", data_dir.join("settings.toml")),
            interactive: env_parse("MODKEEPER_STATS_INTERACTIVE", false)?,
            selection_timeout: Duration::from_secs(env_parse(
                "MODKEEPER_SELECTION_TIMEOUT_SECS",
                300,
            )?),
            flush_timeout: Duration::from_secs(env_parse("MODKEEPER_FLUSH_TIMEOUT_SECS", 5)?),
            settle_delay: Duration::from_millis(env_parse("MODKEEPER_SETTLE_DELAY_MS", 2000)?),
            data_dir,
        })
    }

    pub fn persistence(&self) -> PersistenceConfig {
        if self.interactive {
            PersistenceConfig::interactive()
        } else {
            PersistenceConfig::production()
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(key).map(PathBuf::from).unwrap_or(default)
}
