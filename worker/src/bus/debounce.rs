//! Suppresses repeated configuration broadcasts.
//!
//! The same `(key, value)` pair is sent at most once per window. Entries are
//! kept for a retention period and pruned periodically so the table does not
//! grow without bound.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

pub struct ConfigDebouncer {
    window: Duration,
    retention: Duration,
    last_sent: DashMap<(String, String), Instant>,
}

impl Default for ConfigDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_RETENTION)
    }
}

impl ConfigDebouncer {
    pub fn new(window: Duration, retention: Duration) -> Self {
        Self {
            window,
            retention,
            last_sent: DashMap::new(),
        }
    }

    pub fn should_send(&self, key: &str, value: &serde_json::Value) -> bool {
        self.should_send_at(key, value, Instant::now())
    }

    /// Suppressed attempts do not extend the window.
    pub fn should_send_at(&self, key: &str, value: &serde_json::Value, now: Instant) -> bool {
        match self.last_sent.entry((key.to_string(), value.to_string())) {
            Entry::Occupied(mut sent) => {
                if now.saturating_duration_since(*sent.get()) < self.window {
                    false
                } else {
                    sent.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn prune_at(&self, now: Instant) -> usize {
        let before = self.last_sent.len();
        self.last_sent
            .retain(|_, sent| now.saturating_duration_since(*sent) < self.retention);
        before - self.last_sent.len()
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_within_window_is_suppressed() {
        let debouncer = ConfigDebouncer::default();
        let t0 = Instant::now();

        assert!(debouncer.should_send_at("install_all", &json!(true), t0));
        assert!(!debouncer.should_send_at(
            "install_all",
            &json!(true),
            t0 + Duration::from_millis(40)
        ));
        assert!(debouncer.should_send_at(
            "install_all",
            &json!(true),
            t0 + Duration::from_millis(150)
        ));
    }

    #[test]
    fn test_different_values_are_independent() {
        let debouncer = ConfigDebouncer::default();
        let t0 = Instant::now();

        assert!(debouncer.should_send_at("install_all", &json!(true), t0));
        assert!(debouncer.should_send_at("install_all", &json!(false), t0));
        assert!(debouncer.should_send_at("auto_delete_unselected", &json!(true), t0));
    }

    #[test]
    fn test_prune_drops_expired_entries() {
        let debouncer = ConfigDebouncer::new(DEFAULT_WINDOW, Duration::from_secs(1));
        let t0 = Instant::now();
        debouncer.should_send_at("a", &json!(1), t0);
        debouncer.should_send_at("b", &json!(2), t0 + Duration::from_millis(900));

        assert_eq!(debouncer.prune_at(t0 + Duration::from_millis(1200)), 1);
        assert_eq!(debouncer.len(), 1);
    }
}
