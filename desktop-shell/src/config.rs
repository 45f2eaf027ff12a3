use std::time::Duration;

use shared_types::env::env_parse;

#[derive(Debug, Clone)]
pub struct Config {
    /// Prompt on the terminal for file selection. When false every offered
    /// file is selected.
    pub interactive: bool,
    /// Pause between supervising passes while every endpoint is connected.
    pub healthy_interval: Duration,
    /// Pause after a failed connection attempt.
    pub retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interactive: true,
            healthy_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            interactive: env_parse("MODKEEPER_PROMPT", true)?,
            healthy_interval: Duration::from_millis(env_parse("MODKEEPER_BUS_CHECK_MS", 1000)?),
            retry_interval: Duration::from_millis(env_parse("MODKEEPER_BUS_RETRY_MS", 5000)?),
        })
    }
}
