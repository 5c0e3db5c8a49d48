use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DeviceWardenError;

/// Keys of the persisted agent state. Each key has exactly one owning component.
pub mod keys {
    pub const CURRENT_POLICY: &str = "current_policy";
    pub const EMERGENCY_CODE: &str = "emergency_code";
    pub const EMERGENCY_UNLOCK_UNTIL: &str = "emergency_unlock_until";
    pub const SAFE_MODE: &str = "safe_mode";
    pub const BOOT_COUNTER: &str = "boot_counter";
}

/// Opaque string key-value storage that survives restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&raw)
        .map_err(|err| DeviceWardenError::Store(format!("corrupt value for {key}: {err}")))?;
    Ok(Some(value))
}

pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value).with_context(|| format!("render {key} JSON"))?;
    store.put(key, &raw)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StateFile {
    entries: BTreeMap<String, String>,
}

/// Key-value store kept as a single JSON document on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StateFile>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read state store {}", path.display()))?;
            serde_json::from_str(&contents).context("parse state store JSON")?
        } else {
            StateFile::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &StateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(state).context("render state store JSON")?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, contents)
            .with_context(|| format!("write state store {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replace state store {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state.entries.get(key).cloned())
    }

    /// Memory only changes once the new state is on disk.
    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = state.clone();
        next.entries.insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.entries.contains_key(key) {
            return Ok(());
        }
        let mut next = state.clone();
        next.entries.remove(key);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(key);
        Ok(())
    }
}
