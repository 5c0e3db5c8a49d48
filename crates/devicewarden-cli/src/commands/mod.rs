use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use devicewarden_core::clock::{Clock, SystemClock};
use devicewarden_core::config::{Config, ConfigPaths};
use devicewarden_core::profile::{DeviceProfileClassifier, ProfileClassification};
use devicewarden_core::store::{FileStore, KeyValueStore};
use safety::{BreakerSettings, EmergencyOverride, SafetyCircuitBreaker};

pub mod config;
pub mod emergency;
pub mod policy;
pub mod profile;
pub mod safe_mode;
pub mod status;

/// Paths given on the command line; unset ones fall back to `ConfigPaths`.
#[derive(Debug, Clone, Default)]
pub struct StateInputs {
    pub config_path: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
}

/// The safety components wired against the on-disk agent state.
pub struct LocalState {
    pub config: Config,
    pub classification: ProfileClassification,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub breaker: SafetyCircuitBreaker,
    pub emergency: EmergencyOverride,
}

impl StateInputs {
    pub fn load_config(&self) -> Result<Config> {
        match &self.config_path {
            Some(path) => Config::load(path),
            None => Config::load_or_default(&ConfigPaths::resolve()?.config_path),
        }
    }

    fn resolve_state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(path.clone()),
            None => Ok(ConfigPaths::resolve()?.state_path),
        }
    }

    pub fn open(&self) -> Result<LocalState> {
        let config = self.load_config()?;
        let state_path = self.resolve_state_path()?;
        debug!(state = %state_path.display(), "opening agent state");
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&state_path)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let classification = classify(&config);
        let breaker = SafetyCircuitBreaker::new(
            store.clone(),
            clock.clone(),
            &classification,
            BreakerSettings::from_config(&config.safety),
        );
        let emergency = EmergencyOverride::new(
            store.clone(),
            clock.clone(),
            config.emergency.default_duration_minutes,
        );
        Ok(LocalState {
            config,
            classification,
            store,
            clock,
            breaker,
            emergency,
        })
    }
}

pub fn classify(config: &Config) -> ProfileClassification {
    DeviceProfileClassifier::with_rules(&config.profiles).classify(&config.device_profile())
}

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;

    use super::StateInputs;
    use devicewarden_core::config::Config;

    /// Config and state files in a temp dir. `model` picks the device profile.
    pub fn temp_state(model: &str) -> (TempDir, StateInputs) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default_config();
        config.device.manufacturer = "motorola".to_string();
        config.device.model = model.to_string();
        let config_path = dir.path().join("config.toml");
        config.save(&config_path).unwrap();
        let inputs = StateInputs {
            config_path: Some(config_path),
            state_path: Some(dir.path().join("state.json")),
        };
        (dir, inputs)
    }
}
