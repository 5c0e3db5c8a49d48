use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use devicewarden_core::error::DeviceWardenError;
use devicewarden_core::policy::{BrowserMode, DeliveryApp, PolicyDocument};
use devicewarden_core::profile::ProfileClassification;
use devicewarden_core::provider::{ConfigBundle, RestrictionProvider, SpecialAccess};
use devicewarden_core::restrictions::{self, keys};
use safety::{EmergencyOverride, EmergencyWindow, SafetyCircuitBreaker, TripReason};

pub mod browser;
mod outcome;
pub mod sanitize;
mod store;
pub mod toggles;

pub use outcome::{ApplyOutcome, ApplyReport, ItemFailure, OperationReport};
pub use sanitize::{sanitize, unsafe_reason, Sanitized};
pub use store::PolicyStore;

use toggles::ToggleEffect;

/// Device state an install job must put back when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionSnapshot {
    pub restrictions: BTreeSet<String>,
    pub hidden_apps: BTreeSet<String>,
}

/// Translates policy documents into restriction provider calls.
///
/// Every provider mutation in the agent goes through this type and is
/// serialized by an internal lock, so two loops never race on the device.
pub struct EnforcementEngine {
    provider: Arc<dyn RestrictionProvider>,
    classification: ProfileClassification,
    breaker: Arc<SafetyCircuitBreaker>,
    emergency: Arc<EmergencyOverride>,
    policies: PolicyStore,
    mutation: Mutex<()>,
}

impl EnforcementEngine {
    pub fn new(
        provider: Arc<dyn RestrictionProvider>,
        classification: ProfileClassification,
        breaker: Arc<SafetyCircuitBreaker>,
        emergency: Arc<EmergencyOverride>,
        policies: PolicyStore,
    ) -> Self {
        Self {
            provider,
            classification,
            breaker,
            emergency,
            policies,
            mutation: Mutex::new(()),
        }
    }

    pub fn classification(&self) -> &ProfileClassification {
        &self.classification
    }

    pub fn is_device_owner(&self) -> bool {
        self.provider.is_device_owner()
    }

    /// Sanitize `policy`, run the safety gates, then clear the device and
    /// apply the sanitized document step by step.
    pub fn apply_policy(&self, policy: &PolicyDocument) -> ApplyOutcome {
        if !self.provider.is_device_owner() {
            warn!(policy = %policy.name, "not device owner; policy not applied");
            return ApplyOutcome::NotDeviceOwner;
        }

        let sanitized = sanitize(policy, &self.classification);
        if let Some(reason) = unsafe_reason(&sanitized.policy, &self.classification) {
            error!(policy = %policy.name, %reason, "unsafe policy rejected");
            return match self.breaker.trip(TripReason::UnsafePolicy(reason.clone())) {
                Ok(trip) => ApplyOutcome::RejectedUnsafe { reason, trip },
                Err(err) => ApplyOutcome::Failed {
                    reason: format!("{reason}; safe mode not recorded: {err:#}"),
                },
            };
        }

        match self.enforce(sanitized) {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = format!("{err:#}");
                error!(policy = %policy.name, %reason, "policy application aborted");
                if let Err(trip_err) = self.breaker.trip(TripReason::PolicyFailure(reason.clone())) {
                    error!(error = %trip_err, "could not record safe mode trip");
                }
                ApplyOutcome::Failed { reason }
            }
        }
    }

    /// Re-apply the stored policy, if there is one.
    pub fn reapply_current_policy(&self) -> Result<Option<ApplyOutcome>> {
        match self.policies.load()? {
            Some(policy) => Ok(Some(self.apply_policy(&policy))),
            None => Ok(None),
        }
    }

    fn enforce(&self, sanitized: Sanitized) -> Result<ApplyOutcome> {
        if self.emergency.is_active()? {
            info!("emergency unlock active; policy application skipped");
            return Ok(ApplyOutcome::SuspendedByEmergency);
        }
        if self.breaker.is_active()? {
            warn!("safe mode active; policy application suppressed");
            return Ok(ApplyOutcome::SuppressedBySafeMode);
        }

        let Sanitized { policy, removed } = sanitized;
        let _guard = self.lock();
        let mut operations = OperationReport::default();

        self.unblock_apps_locked(&mut operations)?;
        self.remove_restrictions_locked(&mut operations)?;
        self.policies.save(&policy)?;

        let blocked_apps = self.block_apps_locked(&policy, &mut operations)?;
        self.apply_toggles_locked(&policy, &mut operations)?;
        let mode = self.apply_browser_locked(&policy, &mut operations)?;
        for app in &policy.delivery_apps {
            self.setup_delivery_locked(app, &mut operations)?;
        }
        if policy.dev.allow_usb_debugging {
            operations.record(
                keys::DEBUGGING_FEATURES,
                self.provider.clear_restriction(keys::DEBUGGING_FEATURES),
            )?;
        }

        let report = ApplyReport {
            policy_name: policy.name.clone(),
            removed_keys: removed,
            blocked_apps,
            browser_mode: mode.to_string(),
            operations,
        };
        info!(
            policy = %report.policy_name,
            applied = report.operations.applied,
            skipped = report.operations.failures.len(),
            "policy applied"
        );
        Ok(ApplyOutcome::Applied(report))
    }

    /// Unhide every app the stored policy blocked, or the common fallback set.
    pub fn unblock_all_apps(&self) -> Result<OperationReport> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut operations = OperationReport::default();
        self.unblock_apps_locked(&mut operations)?;
        Ok(operations)
    }

    /// Lift every known and every currently active restriction.
    pub fn remove_all_restrictions(&self) -> Result<OperationReport> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut operations = OperationReport::default();
        self.remove_restrictions_locked(&mut operations)?;
        Ok(operations)
    }

    /// Unblock, unrestrict and forget the current policy.
    pub fn clear_all_policies(&self) -> Result<OperationReport> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut operations = OperationReport::default();
        self.unblock_apps_locked(&mut operations)?;
        self.remove_restrictions_locked(&mut operations)?;
        self.policies.clear()?;
        info!(
            cleared = operations.applied,
            skipped = operations.failures.len(),
            "all policies cleared"
        );
        Ok(operations)
    }

    /// Clear the device, then open the emergency window.
    pub fn activate_emergency(&self, duration_minutes: u32) -> Result<EmergencyWindow> {
        let operations = self.clear_all_policies()?;
        if !operations.is_clean() {
            warn!(skipped = operations.failures.len(), "emergency clear was partial");
        }
        self.emergency.activate(duration_minutes)
    }

    pub fn lock_device(&self) -> Result<()> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        self.provider.lock_device()?;
        info!("device locked");
        Ok(())
    }

    pub fn setup_delivery_app(&self, app: &DeliveryApp) -> Result<OperationReport> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut operations = OperationReport::default();
        self.setup_delivery_locked(app, &mut operations)?;
        Ok(operations)
    }

    /// Full delivery setup for each package; `true` when every step succeeded.
    pub fn setup_delivery_apps(&self, packages: &[String]) -> Result<BTreeMap<String, bool>> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut results = BTreeMap::new();
        for package in packages {
            let app = DeliveryApp {
                package_name: package.clone(),
                name: package.clone(),
                grant_overlay_permission: true,
                disable_battery_optimization: true,
                grant_all_permissions: true,
            };
            let mut operations = OperationReport::default();
            self.setup_delivery_locked(&app, &mut operations)?;
            results.insert(package.clone(), operations.is_clean());
        }
        Ok(results)
    }

    pub fn grant_permissions(
        &self,
        package: &str,
        permissions: &[String],
        special: &[SpecialAccess],
    ) -> Result<OperationReport> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut operations = OperationReport::default();
        for permission in permissions {
            operations.record(
                permission,
                self.provider.grant_runtime_permission(package, permission),
            )?;
        }
        for access in special {
            operations.record(
                &format!("{package}:{access:?}"),
                self.provider.grant_special_access(package, *access),
            )?;
        }
        Ok(operations)
    }

    /// Capture the restriction set, plus whether `package` must stay hidden
    /// once an install of it finishes.
    pub fn snapshot_restrictions(&self, package: &str) -> Result<RestrictionSnapshot> {
        self.ensure_device_owner()?;
        let blocked = self.current_blocked_apps()?;
        let _guard = self.lock();
        let restrictions = self.provider.list_active_restrictions()?;
        let mut hidden_apps = BTreeSet::new();
        let hidden_now = self.provider.is_application_installed(package)
            && self.provider.is_application_hidden(package)?;
        if hidden_now || blocked.iter().any(|blocked| blocked == package) {
            hidden_apps.insert(package.to_string());
        }
        Ok(RestrictionSnapshot {
            restrictions,
            hidden_apps,
        })
    }

    /// Lift the install-blocking restrictions and unhide `package` if present.
    pub fn relax_install_restrictions(&self, package: &str) -> Result<OperationReport> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut operations = OperationReport::default();
        if self.provider.is_application_installed(package) {
            operations.record(package, self.provider.hide_application(package, false))?;
        }
        for key in restrictions::INSTALL_BLOCKING {
            operations.record(key, self.provider.clear_restriction(key))?;
        }
        Ok(operations)
    }

    pub fn install_still_blocked(&self) -> Result<bool> {
        let _guard = self.lock();
        let active = self.provider.list_active_restrictions()?;
        Ok(active.contains(keys::INSTALL_APPS))
    }

    /// Make the active restriction set equal to `snapshot` and hide again
    /// the apps it recorded as hidden.
    pub fn restore_restrictions(&self, snapshot: &RestrictionSnapshot) -> Result<OperationReport> {
        self.ensure_device_owner()?;
        let _guard = self.lock();
        let mut operations = OperationReport::default();
        let current = match self.provider.list_active_restrictions() {
            Ok(current) => current,
            Err(err) => {
                operations.record("active restriction list", Err(err))?;
                BTreeSet::new()
            }
        };
        for key in snapshot.restrictions.difference(&current) {
            operations.record(key, self.provider.add_restriction(key))?;
        }
        for key in current.difference(&snapshot.restrictions) {
            operations.record(key, self.provider.clear_restriction(key))?;
        }
        for package in &snapshot.hidden_apps {
            if self.provider.is_application_installed(package) {
                operations.record(package, self.provider.hide_application(package, true))?;
            }
        }
        debug!(
            restored = snapshot.restrictions.len(),
            hidden = snapshot.hidden_apps.len(),
            "restriction snapshot restored"
        );
        Ok(operations)
    }

    pub fn current_policy(&self) -> Result<Option<PolicyDocument>> {
        self.policies.load()
    }

    pub fn current_blocked_apps(&self) -> Result<Vec<String>> {
        Ok(self
            .policies
            .load()?
            .map(|policy| policy.blocked_packages().into_iter().collect())
            .unwrap_or_default())
    }

    fn ensure_device_owner(&self) -> Result<()> {
        if self.provider.is_device_owner() {
            Ok(())
        } else {
            warn!("not device owner; operation refused");
            Err(DeviceWardenError::NotDeviceOwner.into())
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unblock_apps_locked(&self, operations: &mut OperationReport) -> Result<()> {
        let packages: Vec<String> = match self.policies.load() {
            Ok(Some(previous)) => previous.blocked_packages().into_iter().collect(),
            Ok(None) => fallback_blocked_apps(),
            Err(err) => {
                warn!(error = %err, "stored policy unreadable; unblocking common apps");
                fallback_blocked_apps()
            }
        };
        for package in &packages {
            if self.provider.is_application_installed(package) {
                operations.record(package, self.provider.hide_application(package, false))?;
            }
        }
        Ok(())
    }

    fn remove_restrictions_locked(&self, operations: &mut OperationReport) -> Result<()> {
        let mut active: BTreeSet<String> = restrictions::KNOWN_RESTRICTIONS
            .iter()
            .map(|key| key.to_string())
            .collect();
        match self.provider.list_active_restrictions() {
            Ok(current) => active.extend(current),
            Err(err) => operations.record("active restriction list", Err(err))?,
        }
        for key in &active {
            operations.record(key, self.provider.clear_restriction(key))?;
        }

        operations.record("camera", self.provider.set_camera_disabled(false))?;
        operations.record("screen capture", self.provider.set_screen_capture_disabled(false))?;
        operations.record("status bar", self.provider.set_status_bar_disabled(false))?;

        for (index, package) in restrictions::all_browsers().enumerate() {
            if index > 0 && !self.provider.is_application_installed(package) {
                continue;
            }
            operations.record(
                package,
                self.provider.set_application_config(package, ConfigBundle::new()),
            )?;
        }
        for package in restrictions::ALTERNATIVE_BROWSERS {
            if self.provider.is_application_installed(package) {
                operations.record(package, self.provider.hide_application(package, false))?;
            }
        }
        Ok(())
    }

    fn block_apps_locked(&self, policy: &PolicyDocument, operations: &mut OperationReport) -> Result<usize> {
        let mut blocked = 0;
        for package in policy.blocked_packages() {
            if !self.provider.is_application_installed(&package) {
                debug!(%package, "blocked app not installed");
                continue;
            }
            let before = operations.failures.len();
            operations.record(&package, self.provider.hide_application(&package, true))?;
            if operations.failures.len() == before {
                blocked += 1;
            }
        }
        Ok(blocked)
    }

    fn apply_toggles_locked(&self, policy: &PolicyDocument, operations: &mut OperationReport) -> Result<()> {
        let mut requested: BTreeMap<&str, bool> = policy
            .system_restrictions
            .iter()
            .map(|(name, enabled)| (name.as_str(), *enabled))
            .collect();
        for &name in toggles::DEFAULT_ENABLED {
            if !requested.contains_key(name) && !self.classification.is_dangerous(name) {
                requested.insert(name, true);
            }
        }

        for (name, enabled) in requested {
            let Some(effect) = toggles::effect(name) else {
                warn!(toggle = name, "unsupported restriction toggle skipped");
                operations.failures.push(ItemFailure {
                    item: name.to_string(),
                    error: "unsupported toggle".to_string(),
                });
                continue;
            };
            match effect {
                ToggleEffect::Restrictions(keys) => {
                    if enabled {
                        for key in keys {
                            operations.record(key, self.provider.add_restriction(key))?;
                        }
                    }
                }
                ToggleEffect::ScreenCaptureDisabled => {
                    operations.record(name, self.provider.set_screen_capture_disabled(enabled))?;
                }
                ToggleEffect::CameraDisabled => {
                    operations.record(name, self.provider.set_camera_disabled(enabled))?;
                }
                ToggleEffect::LocationForcedOn => {
                    if enabled {
                        operations.record(name, self.provider.set_location_enabled(true))?;
                    }
                }
                ToggleEffect::LocationSettingLocked => {
                    if enabled {
                        operations.record(
                            keys::CONFIG_LOCATION,
                            self.provider.add_restriction(keys::CONFIG_LOCATION),
                        )?;
                        if !policy.dev.allow_usb_debugging {
                            operations.record(
                                keys::DEBUGGING_FEATURES,
                                self.provider.add_restriction(keys::DEBUGGING_FEATURES),
                            )?;
                        }
                    }
                }
                ToggleEffect::StatusBarDisabled => {
                    if enabled {
                        operations.record(name, self.provider.set_status_bar_disabled(true))?;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_browser_locked(
        &self,
        policy: &PolicyDocument,
        operations: &mut OperationReport,
    ) -> Result<BrowserMode> {
        let plan = browser::plan(policy.browser_policies.as_ref());
        for (index, package) in restrictions::PRIMARY_BROWSERS.iter().enumerate() {
            if index > 0 && !self.provider.is_application_installed(package) {
                continue;
            }
            operations.record(
                package,
                self.provider.set_application_config(package, plan.bundle.clone()),
            )?;
        }
        if plan.hide_alternatives {
            for package in restrictions::ALTERNATIVE_BROWSERS {
                if self.provider.is_application_installed(package) {
                    operations.record(package, self.provider.hide_application(package, true))?;
                }
            }
        }
        Ok(plan.mode)
    }

    fn setup_delivery_locked(&self, app: &DeliveryApp, operations: &mut OperationReport) -> Result<()> {
        let package = app.package_name.as_str();
        if !self.provider.is_application_installed(package) {
            warn!(%package, "delivery app not installed");
            operations.failures.push(ItemFailure {
                item: package.to_string(),
                error: "not installed".to_string(),
            });
            return Ok(());
        }

        if app.grant_all_permissions {
            for permission in restrictions::DELIVERY_PERMISSIONS {
                operations.record(
                    permission,
                    self.provider.grant_runtime_permission(package, permission),
                )?;
            }
        }
        if app.grant_overlay_permission {
            operations.record(
                "overlay",
                self.provider.grant_special_access(package, SpecialAccess::Overlay),
            )?;
        }
        if app.disable_battery_optimization {
            operations.record(
                "battery optimization",
                self.provider
                    .grant_special_access(package, SpecialAccess::BatteryOptimizationExempt),
            )?;
        }
        operations.record(
            "background protection",
            self.provider
                .grant_special_access(package, SpecialAccess::BackgroundProtection),
        )?;
        info!(%package, "delivery app configured");
        Ok(())
    }
}

fn fallback_blocked_apps() -> Vec<String> {
    restrictions::COMMONLY_BLOCKED_APPS
        .iter()
        .map(|package| package.to_string())
        .collect()
}
