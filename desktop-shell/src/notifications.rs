//! User-facing notifications.

use tracing::{error, info, warn};

/// Where connection and status notices end up.
pub trait Notifier: Send + Sync {
    /// The bus went away. Called once per outage.
    fn connection_lost(&self);

    /// A reconnect attempt failed; `attempt` counts from 1.
    fn reconnect_attempt(&self, attempt: u32);

    /// First successful reconnect after an outage.
    fn connection_restored(&self);

    fn notify(&self, title: &str, message: &str);

    fn error(&self, message: &str);
}

/// Renders notifications as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn connection_lost(&self) {
        warn!("Connection to the worker lost");
    }

    fn reconnect_attempt(&self, attempt: u32) {
        warn!(attempt, "Reconnecting to the worker");
    }

    fn connection_restored(&self) {
        info!("Connection to the worker restored");
    }

    fn notify(&self, title: &str, message: &str) {
        info!(title, "{message}");
    }

    fn error(&self, message: &str) {
        error!("{message}");
    }
}
