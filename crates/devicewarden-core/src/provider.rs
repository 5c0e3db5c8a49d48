//! The device-management capability the agent drives. Every operation is
//! idempotent and individually revocable; callers treat each call as best
//! effort and decide for themselves whether a failure matters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("application not installed: {0}")]
    NotInstalled(String),
    #[error("provider rejected {0}")]
    Rejected(String),
    #[error("restriction provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// The provider itself is gone; continuing the current sequence is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
}

/// Application-scoped managed configuration. Empty means "no configuration".
pub type ConfigBundle = BTreeMap<String, ConfigValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialAccess {
    /// Draw over other applications.
    Overlay,
    BatteryOptimizationExempt,
    /// Keep the application visible and pinned so it is not killed in the background.
    BackgroundProtection,
}

pub trait RestrictionProvider: Send + Sync {
    fn is_device_owner(&self) -> bool;
    fn is_application_installed(&self, package: &str) -> bool;
    fn hide_application(&self, package: &str, hidden: bool) -> ProviderResult<()>;
    fn is_application_hidden(&self, package: &str) -> ProviderResult<bool>;
    fn add_restriction(&self, key: &str) -> ProviderResult<()>;
    fn clear_restriction(&self, key: &str) -> ProviderResult<()>;
    fn list_active_restrictions(&self) -> ProviderResult<BTreeSet<String>>;
    fn set_application_config(&self, package: &str, bundle: ConfigBundle) -> ProviderResult<()>;
    fn set_screen_capture_disabled(&self, disabled: bool) -> ProviderResult<()>;
    fn set_camera_disabled(&self, disabled: bool) -> ProviderResult<()>;
    fn set_location_enabled(&self, enabled: bool) -> ProviderResult<()>;
    fn set_status_bar_disabled(&self, disabled: bool) -> ProviderResult<()>;
    fn grant_runtime_permission(&self, package: &str, permission: &str) -> ProviderResult<()>;
    fn grant_special_access(&self, package: &str, access: SpecialAccess) -> ProviderResult<()>;
    fn lock_device(&self) -> ProviderResult<()>;
}

/// Mutation recorded by [`InMemoryProvider`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOp {
    Hide { package: String, hidden: bool },
    AddRestriction(String),
    ClearRestriction(String),
    SetConfig { package: String, keys: usize },
    ScreenCaptureDisabled(bool),
    CameraDisabled(bool),
    LocationEnabled(bool),
    StatusBarDisabled(bool),
    Grant { package: String, permission: String },
    Special { package: String, access: SpecialAccess },
    Lock,
}

#[derive(Debug, Default)]
struct DeviceState {
    installed: BTreeSet<String>,
    hidden: BTreeSet<String>,
    restrictions: BTreeSet<String>,
    configs: BTreeMap<String, ConfigBundle>,
    screen_capture_disabled: bool,
    camera_disabled: bool,
    location_enabled: bool,
    status_bar_disabled: bool,
    permissions: BTreeSet<(String, String)>,
    special: BTreeSet<(String, SpecialAccess)>,
    failing_keys: BTreeMap<String, ProviderError>,
    pinned: BTreeSet<String>,
    unavailable: Option<String>,
    ops: Vec<ProviderOp>,
}

/// Provider that models device state in memory. Used for dry runs and tests.
#[derive(Debug)]
pub struct InMemoryProvider {
    device_owner: Mutex<bool>,
    state: Mutex<DeviceState>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            device_owner: Mutex::new(true),
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn with_installed<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        for package in packages {
            provider.install(package);
        }
        provider
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_device_owner(&self, owner: bool) {
        *self.device_owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = owner;
    }

    pub fn install(&self, package: impl Into<String>) {
        self.state().installed.insert(package.into());
    }

    pub fn uninstall(&self, package: &str) {
        let mut state = self.state();
        state.installed.remove(package);
        state.hidden.remove(package);
    }

    /// Make every add/clear of `key` fail with `error`.
    pub fn fail_restriction(&self, key: &str, error: ProviderError) {
        self.state().failing_keys.insert(key.to_string(), error);
    }

    /// Clearing `key` reports success but leaves it in force.
    pub fn pin_restriction(&self, key: &str) {
        self.state().pinned.insert(key.to_string());
    }

    /// Every mutation fails with [`ProviderError::Unavailable`].
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state().unavailable = reason.map(str::to_string);
    }

    /// Apply a restriction directly, bypassing the op log.
    pub fn seed_restriction(&self, key: &str) {
        self.state().restrictions.insert(key.to_string());
    }

    pub fn active_restrictions(&self) -> BTreeSet<String> {
        self.state().restrictions.clone()
    }

    pub fn hidden_apps(&self) -> BTreeSet<String> {
        self.state().hidden.clone()
    }

    pub fn config_for(&self, package: &str) -> Option<ConfigBundle> {
        self.state().configs.get(package).cloned()
    }

    pub fn granted_permissions(&self, package: &str) -> BTreeSet<String> {
        self.state()
            .permissions
            .iter()
            .filter(|(owner, _)| owner == package)
            .map(|(_, permission)| permission.clone())
            .collect()
    }

    pub fn special_access(&self, package: &str) -> BTreeSet<SpecialAccess> {
        self.state()
            .special
            .iter()
            .filter(|(owner, _)| owner == package)
            .map(|(_, access)| *access)
            .collect()
    }

    pub fn camera_disabled(&self) -> bool {
        self.state().camera_disabled
    }

    pub fn screen_capture_disabled(&self) -> bool {
        self.state().screen_capture_disabled
    }

    pub fn location_enabled(&self) -> bool {
        self.state().location_enabled
    }

    pub fn status_bar_disabled(&self) -> bool {
        self.state().status_bar_disabled
    }

    pub fn ops(&self) -> Vec<ProviderOp> {
        self.state().ops.clone()
    }

    pub fn lock_count(&self) -> usize {
        self.state()
            .ops
            .iter()
            .filter(|op| matches!(op, ProviderOp::Lock))
            .count()
    }

    fn mutate<T>(
        &self,
        op: ProviderOp,
        apply: impl FnOnce(&mut DeviceState) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let mut state = self.state();
        if let Some(reason) = &state.unavailable {
            return Err(ProviderError::Unavailable(reason.clone()));
        }
        let value = apply(&mut state)?;
        state.ops.push(op);
        Ok(value)
    }
}

impl RestrictionProvider for InMemoryProvider {
    fn is_device_owner(&self) -> bool {
        *self.device_owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_application_installed(&self, package: &str) -> bool {
        self.state().installed.contains(package)
    }

    fn hide_application(&self, package: &str, hidden: bool) -> ProviderResult<()> {
        let op = ProviderOp::Hide {
            package: package.to_string(),
            hidden,
        };
        self.mutate(op, |state| {
            if !state.installed.contains(package) {
                return Err(ProviderError::NotInstalled(package.to_string()));
            }
            if hidden {
                state.hidden.insert(package.to_string());
            } else {
                state.hidden.remove(package);
            }
            Ok(())
        })
    }

    fn is_application_hidden(&self, package: &str) -> ProviderResult<bool> {
        let state = self.state();
        if !state.installed.contains(package) {
            return Err(ProviderError::NotInstalled(package.to_string()));
        }
        Ok(state.hidden.contains(package))
    }

    fn add_restriction(&self, key: &str) -> ProviderResult<()> {
        self.mutate(ProviderOp::AddRestriction(key.to_string()), |state| {
            if let Some(error) = state.failing_keys.get(key) {
                return Err(error.clone());
            }
            state.restrictions.insert(key.to_string());
            Ok(())
        })
    }

    fn clear_restriction(&self, key: &str) -> ProviderResult<()> {
        self.mutate(ProviderOp::ClearRestriction(key.to_string()), |state| {
            if let Some(error) = state.failing_keys.get(key) {
                return Err(error.clone());
            }
            if !state.pinned.contains(key) {
                state.restrictions.remove(key);
            }
            Ok(())
        })
    }

    fn list_active_restrictions(&self) -> ProviderResult<BTreeSet<String>> {
        let state = self.state();
        if let Some(reason) = &state.unavailable {
            return Err(ProviderError::Unavailable(reason.clone()));
        }
        Ok(state.restrictions.clone())
    }

    fn set_application_config(&self, package: &str, bundle: ConfigBundle) -> ProviderResult<()> {
        let op = ProviderOp::SetConfig {
            package: package.to_string(),
            keys: bundle.len(),
        };
        self.mutate(op, |state| {
            if bundle.is_empty() {
                state.configs.remove(package);
            } else {
                state.configs.insert(package.to_string(), bundle);
            }
            Ok(())
        })
    }

    fn set_screen_capture_disabled(&self, disabled: bool) -> ProviderResult<()> {
        self.mutate(ProviderOp::ScreenCaptureDisabled(disabled), |state| {
            state.screen_capture_disabled = disabled;
            Ok(())
        })
    }

    fn set_camera_disabled(&self, disabled: bool) -> ProviderResult<()> {
        self.mutate(ProviderOp::CameraDisabled(disabled), |state| {
            state.camera_disabled = disabled;
            Ok(())
        })
    }

    fn set_location_enabled(&self, enabled: bool) -> ProviderResult<()> {
        self.mutate(ProviderOp::LocationEnabled(enabled), |state| {
            state.location_enabled = enabled;
            Ok(())
        })
    }

    fn set_status_bar_disabled(&self, disabled: bool) -> ProviderResult<()> {
        self.mutate(ProviderOp::StatusBarDisabled(disabled), |state| {
            state.status_bar_disabled = disabled;
            Ok(())
        })
    }

    fn grant_runtime_permission(&self, package: &str, permission: &str) -> ProviderResult<()> {
        let op = ProviderOp::Grant {
            package: package.to_string(),
            permission: permission.to_string(),
        };
        self.mutate(op, |state| {
            if !state.installed.contains(package) {
                return Err(ProviderError::NotInstalled(package.to_string()));
            }
            state
                .permissions
                .insert((package.to_string(), permission.to_string()));
            Ok(())
        })
    }

    fn grant_special_access(&self, package: &str, access: SpecialAccess) -> ProviderResult<()> {
        let op = ProviderOp::Special {
            package: package.to_string(),
            access,
        };
        self.mutate(op, |state| {
            if !state.installed.contains(package) {
                return Err(ProviderError::NotInstalled(package.to_string()));
            }
            if access == SpecialAccess::BackgroundProtection {
                state.hidden.remove(package);
            }
            state.special.insert((package.to_string(), access));
            Ok(())
        })
    }

    fn lock_device(&self) -> ProviderResult<()> {
        self.mutate(ProviderOp::Lock, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hide_requires_installed_package() {
        let provider = InMemoryProvider::with_installed(["com.example.app"]);
        provider.hide_application("com.example.app", true).unwrap();
        assert!(provider.is_application_hidden("com.example.app").unwrap());
        assert_eq!(
            provider.hide_application("com.missing", true),
            Err(ProviderError::NotInstalled("com.missing".to_string()))
        );
    }

    #[test]
    fn test_pinned_restriction_survives_clear() {
        let provider = InMemoryProvider::new();
        provider.add_restriction("no_install_apps").unwrap();
        provider.pin_restriction("no_install_apps");
        provider.clear_restriction("no_install_apps").unwrap();
        assert!(provider.active_restrictions().contains("no_install_apps"));
    }

    #[test]
    fn test_unavailable_provider_is_fatal() {
        let provider = InMemoryProvider::new();
        provider.set_unavailable(Some("service died"));
        let error = provider.add_restriction("no_config_wifi").unwrap_err();
        assert!(error.is_fatal());
        assert!(provider.ops().is_empty());
    }
}
