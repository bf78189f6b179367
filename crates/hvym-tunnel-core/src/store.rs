//! Persisted tunnel configuration.
//!
//! The engine reads a [`ConfigRecord`] to start and writes back the
//! discovered relay address and the last public endpoint. Persistence is a
//! small JSON settings file; callers embedding the engine in a larger app
//! can implement [`ConfigStore`] over their own settings storage instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default relay WebSocket URL.
pub const DEFAULT_SERVER_URL: &str = "wss://tunnel.hvym.link/connect";

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_port_bindings() -> BTreeMap<String, u16> {
    [("pintheon".to_string(), 9998)].into_iter().collect()
}

/// Persisted tunnel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    /// Relay WebSocket URL, user-settable.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Relay's public address, auto-discovered or manually entered.
    /// Advisory: the engine never invents one.
    #[serde(default)]
    pub server_address: String,

    /// Service name → local port map.
    #[serde(default = "default_port_bindings")]
    pub port_bindings: BTreeMap<String, u16>,

    /// Whether to connect automatically on startup.
    #[serde(default)]
    pub auto_connect: bool,

    /// Public endpoint URL from the most recent session, cleared on
    /// disconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_endpoint: Option<String>,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            server_address: String::new(),
            port_bindings: default_port_bindings(),
            auto_connect: false,
            last_endpoint: None,
        }
    }
}

/// Storage for the tunnel configuration record.
///
/// Load/save are whole-record; the provided mutators do a
/// read-modify-write, so implementations should be internally synchronized.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<ConfigRecord>;
    fn save(&self, record: &ConfigRecord) -> Result<()>;

    /// Record a discovered relay address.
    fn set_server_address(&self, address: &str) -> Result<()> {
        let mut record = self.load()?;
        record.server_address = address.to_string();
        self.save(&record)
    }

    /// Record the public endpoint of the current session.
    fn set_last_endpoint(&self, url: &str) -> Result<()> {
        let mut record = self.load()?;
        record.last_endpoint = Some(url.to_string());
        self.save(&record)
    }

    /// Clear the stored endpoint after disconnect.
    fn clear_last_endpoint(&self) -> Result<()> {
        let mut record = self.load()?;
        record.last_endpoint = None;
        self.save(&record)
    }
}

/// JSON-file-backed config store.
pub struct JsonConfigStore {
    path: PathBuf,
    // Serializes read-modify-write cycles from concurrent tasks.
    lock: Mutex<()>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Default settings path: `<config dir>/hvym-tunnel/settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hvym-tunnel").join("settings.json"))
    }

    fn read_record(path: &Path) -> Result<ConfigRecord> {
        if !path.exists() {
            return Ok(ConfigRecord::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<ConfigRecord> {
        let _guard = self.lock.lock().map_err(|_| {
            Error::Config("config store lock poisoned".into())
        })?;
        Self::read_record(&self.path)
    }

    fn save(&self, record: &ConfigRecord) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| {
            Error::Config("config store lock poisoned".into())
        })?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(record)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// In-memory config store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryConfigStore {
    record: Mutex<ConfigRecord>,
}

impl MemoryConfigStore {
    pub fn new(record: ConfigRecord) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<ConfigRecord> {
        self.record
            .lock()
            .map(|r| r.clone())
            .map_err(|_| Error::Config("config store lock poisoned".into()))
    }

    fn save(&self, record: &ConfigRecord) -> Result<()> {
        *self
            .record
            .lock()
            .map_err(|_| Error::Config("config store lock poisoned".into()))? = record.clone();
        Ok(())
    }
}
