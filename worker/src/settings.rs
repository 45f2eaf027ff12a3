//! Settings store - persisted user preferences shared over `/config`
//!
//! Settings live in a TOML file inside the data directory. Every change goes
//! through [`SettingsStore::apply`], which validates the new value against the
//! typed [`Settings`] struct, writes the file and publishes a
//! [`SettingChange`] to subscribers.
//!
//! Changes carry a [`ChangeOrigin`]. The bus relays every change to its
//! `/config` peers except the one a `Remote` change came from.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::bus::PeerId;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Install every extracted file without asking.
    pub install_all: bool,
    /// Delete extracted files the user did not select.
    pub auto_delete_unselected: bool,
    pub downloads_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub mods_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self::rooted_at(Path::new("./data"))
    }
}

impl Settings {
    /// Defaults with every folder placed under `data_dir`.
    pub fn rooted_at(data_dir: &Path) -> Self {
        Self {
            install_all: false,
            auto_delete_unselected: false,
            downloads_dir: data_dir.join("downloads"),
            staging_dir: data_dir.join("staging"),
            mods_dir: data_dir.join("mods"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Made by this process.
    Local,
    /// Received from the bus peer with this id.
    Remote(PeerId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub key: String,
    pub value: serde_json::Value,
    pub origin: ChangeOrigin,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("settings file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to encode settings: {0}")]
    Encode(String),
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<Settings>,
    changes: broadcast::Sender<SettingChange>,
}

impl SettingsStore {
    /// Load settings from `path`, writing `defaults` there when the file does
    /// not exist yet.
    pub fn load(path: impl Into<PathBuf>, defaults: Settings) -> Result<Arc<Self>, SettingsError> {
        let path = path.into();
        let settings = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            toml::from_str(&raw)?
        } else {
            write_settings(&path, &defaults)?;
            tracing::info!(path = %path.display(), "Created default settings file");
            defaults
        };

        Ok(Arc::new(Self::build(Some(path), settings)))
    }

    /// A store that never touches disk.
    pub fn in_memory(settings: Settings) -> Arc<Self> {
        Arc::new(Self::build(None, settings))
    }

    fn build(path: Option<PathBuf>, settings: Settings) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            path,
            current: RwLock::new(settings),
            changes,
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettingChange> {
        self.changes.subscribe()
    }

    /// Set `key` to `value`.
    ///
    /// Returns `Ok(false)` when the value is already current; nothing is
    /// written or published in that case.
    pub fn apply(
        &self,
        key: &str,
        value: serde_json::Value,
        origin: ChangeOrigin,
    ) -> Result<bool, SettingsError> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut document =
            serde_json::to_value(&*current).map_err(|e| SettingsError::Encode(e.to_string()))?;
        let Some(fields) = document.as_object_mut() else {
            return Err(SettingsError::Encode("settings are not an object".to_string()));
        };

        match fields.get(key) {
            None => return Err(SettingsError::UnknownKey(key.to_string())),
            Some(existing) if *existing == value => return Ok(false),
            Some(_) => {}
        }
        fields.insert(key.to_string(), value.clone());

        let updated: Settings =
            serde_json::from_value(document).map_err(|e| SettingsError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(path) = &self.path {
            write_settings(path, &updated)?;
        }
        *current = updated;
        drop(current);

        tracing::info!(key, ?origin, "Setting changed");
        // No subscribers is fine; the change is already persisted.
        let _ = self.changes.send(SettingChange {
            key: key.to_string(),
            value,
            origin,
        });
        Ok(true)
    }
}

fn write_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let encoded =
        toml::to_string_pretty(settings).map_err(|e| SettingsError::Encode(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }

    // Write-then-rename so a crash never leaves a truncated file behind.
    let staging = path.with_extension("toml.tmp");
    std::fs::write(&staging, encoded)
        .and_then(|_| std::fs::rename(&staging, path))
        .map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_updates_and_publishes() {
        let store = SettingsStore::in_memory(Settings::default());
        let mut changes = store.subscribe();

        let changed = store
            .apply("install_all", json!(true), ChangeOrigin::Remote(3))
            .unwrap();
        assert!(changed);
        assert!(store.snapshot().install_all);

        let change = changes.try_recv().unwrap();
        assert_eq!(change.key, "install_all");
        assert_eq!(change.origin, ChangeOrigin::Remote(3));
    }

    #[test]
    fn test_apply_same_value_is_noop() {
        let store = SettingsStore::in_memory(Settings::default());
        let mut changes = store.subscribe();

        let changed = store
            .apply("install_all", json!(false), ChangeOrigin::Local)
            .unwrap();
        assert!(!changed);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_apply_rejects_unknown_key_and_bad_type() {
        let store = SettingsStore::in_memory(Settings::default());
        assert!(matches!(
            store.apply("theme", json!("dark"), ChangeOrigin::Local),
            Err(SettingsError::UnknownKey(_))
        ));
        assert!(matches!(
            store.apply("install_all", json!("yes"), ChangeOrigin::Local),
            Err(SettingsError::InvalidValue { .. })
        ));
        assert!(!store.snapshot().install_all);
    }

    #[test]
    fn test_load_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let defaults = Settings::rooted_at(dir.path());

        let store = SettingsStore::load(&path, defaults.clone()).unwrap();
        assert!(path.exists());
        store
            .apply("auto_delete_unselected", json!(true), ChangeOrigin::Local)
            .unwrap();

        let reloaded = SettingsStore::load(&path, defaults).unwrap();
        assert!(reloaded.snapshot().auto_delete_unselected);
        assert_eq!(reloaded.snapshot().mods_dir, dir.path().join("mods"));
    }
}
