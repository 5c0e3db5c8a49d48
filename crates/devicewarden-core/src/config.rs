use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::backend::HardwareInfo;
use crate::error::DeviceWardenError;
use crate::profile::{DeviceProfile, ProfileRule};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub safety: SafetyConfig,
    pub emergency: EmergencyConfig,
    pub install: InstallConfig,
    pub boot: BootConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<ProfileRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub manufacturer: String,
    pub model: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
    pub emergency_poll_secs: u64,
    pub auxiliary_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub boot_threshold: u32,
    pub boot_window_secs: u64,
    pub battery_floor_percent: u8,
    pub excessive_activation_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    pub default_duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    pub settle_delay_ms: u64,
    pub verify_delay_ms: u64,
    pub grant_delay_ms: u64,
    pub chunk_size: usize,
    pub auto_update: bool,
    pub update_spacing_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    pub policy_reapply_delay_secs: u64,
    pub sync_delay_secs: u64,
    pub register_delay_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub state_path: PathBuf,
    pub download_dir: PathBuf,
}

impl Config {
    pub fn default_config() -> Self {
        Self {
            device: DeviceConfig {
                device_id: "unenrolled".to_string(),
                manufacturer: "generic".to_string(),
                model: "generic".to_string(),
                os_version: "unknown".to_string(),
            },
            backend: BackendConfig {
                base_url: "https://mdm.invalid/api".to_string(),
                connect_timeout_secs: 15,
                read_timeout_secs: 15,
                download_timeout_secs: 60,
            },
            sync: SyncConfig {
                interval_secs: 300,
                initial_delay_secs: 5,
                emergency_poll_secs: 60,
                auxiliary_interval_secs: 900,
                backoff_base_secs: 30,
                backoff_cap_secs: 300,
            },
            safety: SafetyConfig {
                boot_threshold: 3,
                boot_window_secs: 600,
                battery_floor_percent: 20,
                excessive_activation_count: 5,
            },
            emergency: EmergencyConfig {
                default_duration_minutes: 30,
            },
            install: InstallConfig {
                settle_delay_ms: 500,
                verify_delay_ms: 5000,
                grant_delay_ms: 3000,
                chunk_size: 64 * 1024,
                auto_update: false,
                update_spacing_secs: 10,
            },
            boot: BootConfig {
                policy_reapply_delay_secs: 120,
                sync_delay_secs: 180,
                register_delay_secs: 300,
            },
            profiles: Vec::new(),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let output = toml::to_string_pretty(self).context("render config TOML")?;
        Ok(output)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read config at {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let contents = self.to_toml_string()?;
        fs::write(path, contents).with_context(|| format!("write config at {}", path.display()))?;
        Ok(())
    }

    /// Load `path`, falling back to defaults when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default_config())
        }
    }

    pub fn validate(&self) -> Result<(), DeviceWardenError> {
        if self.safety.boot_threshold == 0 {
            return Err(DeviceWardenError::InvalidConfig(
                "safety.boot_threshold must be at least 1".to_string(),
            ));
        }
        if self.sync.backoff_base_secs == 0 || self.sync.backoff_cap_secs < self.sync.backoff_base_secs {
            return Err(DeviceWardenError::InvalidConfig(
                "sync.backoff_cap_secs must be >= backoff_base_secs > 0".to_string(),
            ));
        }
        if self.install.chunk_size == 0 {
            return Err(DeviceWardenError::InvalidConfig(
                "install.chunk_size must be positive".to_string(),
            ));
        }
        if self.safety.battery_floor_percent > 100 {
            return Err(DeviceWardenError::InvalidConfig(
                "safety.battery_floor_percent must be a percentage".to_string(),
            ));
        }
        Ok(())
    }

    pub fn device_profile(&self) -> DeviceProfile {
        DeviceProfile::new(&self.device.manufacturer, &self.device.model)
    }

    pub fn hardware_info(&self) -> HardwareInfo {
        HardwareInfo {
            manufacturer: self.device.manufacturer.clone(),
            model: self.device.model.clone(),
            os_version: self.device.os_version.clone(),
            serial_number: None,
        }
    }
}

impl BackendConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl ConfigPaths {
    pub fn resolve() -> Result<Self> {
        let project_dirs = ProjectDirs::from("io", "devicewarden", "devicewarden")
            .ok_or_else(|| anyhow::anyhow!("unable to determine project directories"))?;
        let config_dir = project_dirs.config_dir();
        let data_dir = project_dirs.data_dir();
        Ok(Self {
            config_path: config_dir.join("config.toml"),
            data_dir: data_dir.to_path_buf(),
            state_path: data_dir.join("state.json"),
            download_dir: data_dir.join("downloads"),
        })
    }
}
