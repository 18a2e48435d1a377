//! Persistent key-value store and the typed status store on top of it.
//!
//! Values are whole JSON objects under three top-level keys; there is no
//! querying. Writes are read-modify-write without cross-process locking.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::models::{is_signed_in_today, SignInStatus, SiteConfig, SiteConfigs, StatusEntry};
use crate::settings::StatusPolicy;

pub const SITE_CONFIGS_KEY: &str = "siteConfigs";
pub const SIGN_IN_STATUSES_KEY: &str = "signInStatuses";
pub const SHOW_PROCESS_KEY: &str = "showProcess";

pub type StatusMap = BTreeMap<String, SignInStatus>;

/// Get/set whole values by key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// All keys in one pretty-printed JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read store {}", self.path.display()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Store {} is not a JSON object", self.path.display()))
    }

    fn write_all(&self, entries: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write then rename so a crash never leaves a truncated store.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace store {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("Store lock poisoned"))?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("Store lock poisoned"))?;
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value);
        self.write_all(&entries)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Map<String, Value>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.entries.lock().map_err(|_| anyhow::anyhow!("Store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow::anyhow!("Store lock poisoned"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Typed access to site configs, sign-in statuses and the UI preference.
pub struct StatusStore<S> {
    backend: S,
}

impl<S: KeyValueStore> StatusStore<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    fn read<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.backend.get(key)? {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value)
                .with_context(|| format!("Stored '{}' has an unexpected shape", key)),
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.backend.set(key, serde_json::to_value(value)?)
    }

    pub fn site_configs(&self) -> Result<SiteConfigs> {
        self.read(SITE_CONFIGS_KEY)
    }

    /// Validate and upsert one config; returns the updated collection.
    pub fn save_site_config(&self, mut config: SiteConfig) -> Result<SiteConfigs> {
        config.validate()?;
        config.ensure_id();

        let mut configs = self.site_configs()?;
        configs.upsert(config);
        self.write(SITE_CONFIGS_KEY, &configs)?;
        Ok(configs)
    }

    /// Remove a config. Its status entry is left alone.
    pub fn delete_site_config(&self, id: &str) -> Result<(SiteConfigs, bool)> {
        let mut configs = self.site_configs()?;
        let removed = configs.remove(id).is_some();
        if removed {
            self.write(SITE_CONFIGS_KEY, &configs)?;
        }
        Ok((configs, removed))
    }

    pub fn statuses(&self) -> Result<StatusMap> {
        self.read(SIGN_IN_STATUSES_KEY)
    }

    /// Write this run's successes according to `policy`.
    pub fn record_statuses(&self, updates: StatusMap, policy: StatusPolicy) -> Result<()> {
        let statuses = match policy {
            StatusPolicy::Replace => updates,
            StatusPolicy::Merge => {
                let mut existing = self.statuses()?;
                existing.extend(updates);
                existing
            }
        };
        self.write(SIGN_IN_STATUSES_KEY, &statuses)
    }

    pub fn show_process(&self) -> Result<bool> {
        self.read(SHOW_PROCESS_KEY)
    }

    pub fn set_show_process(&self, show: bool) -> Result<()> {
        self.write(SHOW_PROCESS_KEY, &show)
    }
}

/// Snapshot of configs and statuses held by the daemon between requests.
///
/// Nothing refreshes it implicitly; callers reload with [`AppState::load`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
    pub configs: SiteConfigs,
    pub statuses: StatusMap,
}

impl AppState {
    pub fn load<S: KeyValueStore>(store: &StatusStore<S>) -> Result<Self> {
        Ok(Self {
            configs: store.site_configs()?,
            statuses: store.statuses()?,
        })
    }

    /// One row per configured site, in configuration order.
    pub fn status_report(&self, now: DateTime<Local>) -> Vec<StatusEntry> {
        self.configs
            .iter()
            .map(|config| {
                let status = self.statuses.get(&config.id);
                StatusEntry {
                    site_id: config.id.clone(),
                    name: config.name.clone(),
                    url: config.url.clone(),
                    signed_in_today: is_signed_in_today(status, now),
                    last_sign_in_date: status.and_then(|s| s.last_sign_in_date),
                    last_message: status.map(|s| s.last_message.clone()),
                }
            })
            .collect()
    }
}
