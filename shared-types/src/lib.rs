//! Shared types between the launcher, worker and desktop shell
//!
//! These types are used by:
//! - the message bus server hosted in the worker
//! - the message bus client hosted in the desktop shell
//! - the launcher, for the child process launch contract
//!
//! Serializable with serde for JSON over WebSocket

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Endpoints
// ============================================================================

/// A named logical channel multiplexed over the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Config,
    Error,
    Status,
    Notifications,
    Install,
}

impl Endpoint {
    /// Every endpoint accepted by the bus, in connection order.
    pub const ALL: [Endpoint; 5] = [
        Endpoint::Config,
        Endpoint::Error,
        Endpoint::Status,
        Endpoint::Notifications,
        Endpoint::Install,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Config => "/config",
            Endpoint::Error => "/error",
            Endpoint::Status => "/status",
            Endpoint::Notifications => "/notifications",
            Endpoint::Install => "/install",
        }
    }

    /// Validate a raw request path against the allow-list.
    ///
    /// The path is trimmed, prefixed with `/` when missing, stripped of
    /// control characters and compared case-insensitively. Query strings are
    /// not part of an endpoint and make the path invalid.
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let cleaned: String = raw.trim().chars().filter(|c| !c.is_control()).collect();
        let normalized = if cleaned.starts_with('/') {
            cleaned.to_ascii_lowercase()
        } else {
            format!("/{}", cleaned.to_ascii_lowercase())
        };

        Self::ALL
            .into_iter()
            .find(|endpoint| endpoint.path() == normalized)
            .ok_or_else(|| EndpointError::NotAllowed(truncate_for_log(&normalized)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint not allowed: {0}")]
    NotAllowed(String),
}

/// Keep rejected paths short in logs; callers control their content.
fn truncate_for_log(path: &str) -> String {
    const MAX: usize = 64;
    if path.chars().count() <= MAX {
        path.to_string()
    } else {
        let head: String = path.chars().take(MAX).collect();
        format!("{head}…")
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Per-instance identifier stamped on every outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginatorId(pub String);

impl OriginatorId {
    /// Generate a fresh id, e.g. `worker-bus-6f0c…`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MessageKind {
    #[default]
    Status,
    Progress,
    Log,
    ConfigurationChange,
}

pub const STATUS_CONFIG_UPDATE: &str = "config_update";
pub const STATUS_SELECT_FILES: &str = "select_files";
pub const STATUS_USER_SELECTION: &str = "user_selection";
pub const STATUS_IN_PROGRESS: &str = "InProgress";
pub const STATUS_COMPLETED: &str = "Completed";
pub const STATUS_FAILED: &str = "Failed";

/// The structured message unit exchanged over the bus.
///
/// `message` frequently carries a JSON document of its own; use
/// [`Envelope::with_payload`] and [`Envelope::payload`] for those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(rename = "Type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub originator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl Envelope {
    pub fn new(kind: MessageKind, status: impl Into<String>) -> Self {
        Self {
            kind,
            status: status.into(),
            task_id: String::new(),
            originator_id: String::new(),
            title: None,
            message: String::new(),
            progress: None,
        }
    }

    pub fn status(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(MessageKind::Status, status).with_message(message)
    }

    /// A configuration change for `key`, carried as a [`ConfigUpdate`] payload.
    pub fn config_update(
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Self::new(MessageKind::ConfigurationChange, STATUS_CONFIG_UPDATE).with_payload(
            &ConfigUpdate {
                key: key.into(),
                value,
            },
        )
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Progress is clamped to 0..=100.
    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.message = serde_json::to_string(payload)?;
        Ok(self)
    }

    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.message)
    }

    pub fn stamped(mut self, originator: &OriginatorId) -> Self {
        self.originator_id = originator.0.clone();
        self
    }

    /// True when this envelope was sent by `me`.
    pub fn is_from(&self, me: &OriginatorId) -> bool {
        !self.originator_id.is_empty() && self.originator_id == me.0
    }

    pub fn is_config_change(&self) -> bool {
        self.kind == MessageKind::ConfigurationChange || self.status == STATUS_CONFIG_UPDATE
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Body of a `config_update` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub key: String,
    pub value: serde_json::Value,
}

/// Body of a `select_files` request published on `/install`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectFilesRequest {
    pub archive: String,
    pub files: Vec<String>,
}

/// Body of a `user_selection` response sent back on `/install`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserSelection {
    pub files: Vec<String>,
}

/// Body of the completion status broadcast after an install run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstallSummary {
    pub archive: String,
    pub installed: Vec<String>,
    pub failed: Vec<String>,
    pub deleted: usize,
    pub timed_out: bool,
}

impl InstallSummary {
    /// `Failed` only when something was attempted and nothing succeeded.
    pub fn status(&self) -> &'static str {
        if self.installed.is_empty() && !self.failed.is_empty() {
            STATUS_FAILED
        } else {
            STATUS_COMPLETED
        }
    }
}

// ============================================================================
// Launch contract
// ============================================================================

pub mod launch {
    //! Contract between the launcher and its child processes.

    /// Set to `1` by the launcher on every child it spawns.
    pub const SUPERVISED_ENV: &str = "MODKEEPER_SUPERVISED";

    /// Line written to the worker's stdin to request a graceful stop.
    pub const SHUTDOWN_COMMAND: &str = "shutdown";

    pub const MIN_PORT: u16 = 1024;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum LaunchError {
        #[error("not launched by the supervisor ({SUPERVISED_ENV} is not set)")]
        NotSupervised,
        #[error("missing rendezvous port argument")]
        MissingPort,
        #[error("invalid rendezvous port {0:?}: expected a decimal number in 1024-65535")]
        InvalidPort(String),
    }

    /// Parse the single positional port argument.
    pub fn parse_port(raw: &str) -> Result<u16, LaunchError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LaunchError::InvalidPort(raw.to_string()));
        }
        match trimmed.parse::<u16>() {
            Ok(port) if port >= MIN_PORT => Ok(port),
            _ => Err(LaunchError::InvalidPort(raw.to_string())),
        }
    }

    /// Port from an argv-style iterator (program name first).
    pub fn port_from_args<I>(args: I) -> Result<u16, LaunchError>
    where
        I: IntoIterator<Item = String>,
    {
        let raw = args.into_iter().nth(1).ok_or(LaunchError::MissingPort)?;
        parse_port(&raw)
    }

    pub fn is_supervised_value(value: Option<&str>) -> bool {
        matches!(value.map(str::trim), Some("1") | Some("true"))
    }

    /// Refuse to run unless the launcher started this process.
    pub fn require_supervised() -> Result<(), LaunchError> {
        let value = std::env::var(SUPERVISED_ENV).ok();
        if is_supervised_value(value.as_deref()) {
            Ok(())
        } else {
            Err(LaunchError::NotSupervised)
        }
    }
}

pub mod env {
    //! Environment lookups shared by every process's config loader.

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("Failed to parse env var {key}={value}: {reason}")]
    pub struct EnvError {
        pub key: String,
        pub value: String,
        pub reason: String,
    }

    pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, EnvError>
    where
        T::Err: std::fmt::Display,
    {
        parse_or(key, std::env::var(key).ok(), default)
    }

    /// `env_parse` over an already looked-up value.
    pub fn parse_or<T: std::str::FromStr>(
        key: &str,
        value: Option<String>,
        default: T,
    ) -> Result<T, EnvError>
    where
        T::Err: std::fmt::Display,
    {
        match value {
            Some(value) => value.parse::<T>().map_err(|e| EnvError {
                key: key.to_string(),
                reason: e.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse_normalizes() {
        assert_eq!(Endpoint::parse("/status").unwrap(), Endpoint::Status);
        assert_eq!(Endpoint::parse("  INSTALL ").unwrap(), Endpoint::Install);
        assert_eq!(Endpoint::parse("/con\u{0007}fig").unwrap(), Endpoint::Config);
        assert_eq!(
            Endpoint::parse("/Notifications\r\n").unwrap(),
            Endpoint::Notifications
        );
    }

    #[test]
    fn test_endpoint_parse_rejects_unknown() {
        for raw in ["", "/", "/admin", "/status/extra", "/../config", "/status?x=1"] {
            assert!(Endpoint::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn test_rejected_path_is_truncated() {
        let long = format!("/{}", "a".repeat(500));
        let EndpointError::NotAllowed(shown) = Endpoint::parse(&long).unwrap_err();
        assert!(shown.chars().count() <= 65);
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let envelope = Envelope::status(STATUS_COMPLETED, "done")
            .with_task_id("task-1")
            .with_title("Install")
            .with_progress(250)
            .stamped(&OriginatorId("worker-1".to_string()));

        let value: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["Type"], "Status");
        assert_eq!(value["Status"], "Completed");
        assert_eq!(value["TaskId"], "task-1");
        assert_eq!(value["OriginatorId"], "worker-1");
        assert_eq!(value["Title"], "Install");
        assert_eq!(value["Message"], "done");
        assert_eq!(value["Progress"], 100);
    }

    #[test]
    fn test_envelope_tolerates_missing_fields() {
        let envelope = Envelope::from_json(r#"{"Status":"user_selection"}"#).unwrap();
        assert_eq!(envelope.kind, MessageKind::Status);
        assert_eq!(envelope.status, STATUS_USER_SELECTION);
        assert!(envelope.title.is_none());
        assert!(envelope.progress.is_none());
    }

    #[test]
    fn test_config_update_detection() {
        let envelope = Envelope::config_update("install_all", serde_json::json!(true)).unwrap();
        assert!(envelope.is_config_change());
        let body: ConfigUpdate = envelope.payload().unwrap();
        assert_eq!(body.key, "install_all");

        let by_status = Envelope::new(MessageKind::Status, STATUS_CONFIG_UPDATE);
        assert!(by_status.is_config_change());
        assert!(!Envelope::status(STATUS_COMPLETED, "").is_config_change());
    }

    #[test]
    fn test_is_from_requires_matching_id() {
        let me = OriginatorId::generate("ui");
        let other = OriginatorId::generate("ui");
        assert_ne!(me, other);

        let mine = Envelope::status("x", "").stamped(&me);
        assert!(mine.is_from(&me));
        assert!(!mine.is_from(&other));
        assert!(!Envelope::status("x", "").is_from(&me));
    }

    #[test]
    fn test_install_summary_status() {
        let mut summary = InstallSummary::default();
        assert_eq!(summary.status(), STATUS_COMPLETED);
        summary.failed.push("a.pak".into());
        assert_eq!(summary.status(), STATUS_FAILED);
        summary.installed.push("b.pak".into());
        assert_eq!(summary.status(), STATUS_COMPLETED);
    }

    #[test]
    fn test_launch_port_parsing() {
        use launch::*;
        assert_eq!(parse_port("8080"), Ok(8080));
        assert_eq!(parse_port("65535"), Ok(65535));
        assert!(parse_port("1023").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("-1").is_err());
        assert!(parse_port("80a").is_err());
        assert_eq!(
            port_from_args(vec!["worker".to_string()]),
            Err(LaunchError::MissingPort)
        );
        assert_eq!(
            port_from_args(vec!["worker".to_string(), "4000".to_string()]),
            Ok(4000)
        );
    }

    #[test]
    fn test_env_values_fall_back_and_reject_garbage() {
        use env::parse_or;
        assert_eq!(parse_or("MODKEEPER_X", None, 7u32), Ok(7));
        assert_eq!(parse_or("MODKEEPER_X", Some("42".into()), 7u32), Ok(42));
        assert_eq!(parse_or("MODKEEPER_X", Some("true".into()), false), Ok(true));

        let err = parse_or("MODKEEPER_X", Some("soon".into()), 7u32).unwrap_err();
        assert_eq!(err.key, "MODKEEPER_X");
        assert!(err.to_string().starts_with("Failed to parse env var MODKEEPER_X=soon"));
    }

    #[test]
    fn test_supervised_flag_values() {
        use launch::is_supervised_value;
        assert!(is_supervised_value(Some("1")));
        assert!(is_supervised_value(Some("true")));
        assert!(!is_supervised_value(Some("0")));
        assert!(!is_supervised_value(None));
    }
}
