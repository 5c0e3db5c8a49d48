use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use devicewarden_core::backend::Backend;
use devicewarden_core::clock::Clock;
use devicewarden_core::config::Config;
use devicewarden_core::package::PackageInstaller;
use devicewarden_core::profile::DeviceProfileClassifier;
use devicewarden_core::provider::RestrictionProvider;
use devicewarden_core::store::KeyValueStore;
use devicewarden_core::telemetry::{TelemetryReport, TelemetrySource};
use installer::{AutoUpdater, InstallOrchestrator, InstallReport, InstallSettings};
use policy_engine::{ApplyOutcome, EnforcementEngine, PolicyStore};
use safety::{
    BreakerSettings, EmergencyOverride, SafeModeState, SafetyCircuitBreaker, SafetyReport, TripOutcome,
    TripReason, UnlockOutcome,
};

use crate::dispatch::SyncCycleResult;

/// Host capabilities and persisted state the agent is assembled from.
pub struct AgentParts {
    pub config: Config,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub provider: Arc<dyn RestrictionProvider>,
    pub installer: Arc<dyn PackageInstaller>,
    pub backend: Arc<dyn Backend>,
    pub telemetry: Arc<dyn TelemetrySource>,
}

/// Why the boot sequence stopped before re-applying policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootHalt {
    NotDeviceOwner,
    EmergencyActive,
    SafeMode,
}

#[derive(Debug, Clone, Default)]
pub struct BootReport {
    pub trips: Vec<TripOutcome>,
    pub halted: Option<BootHalt>,
    pub reapplied: Option<ApplyOutcome>,
    pub synced: bool,
    pub registered: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub device_id: String,
    pub device_owner: bool,
    pub policy_name: Option<String>,
    pub blocked_apps: Vec<String>,
    pub safety: SafetyReport,
}

pub struct Agent {
    pub(crate) config: Config,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) telemetry: Arc<dyn TelemetrySource>,
    pub(crate) breaker: Arc<SafetyCircuitBreaker>,
    pub(crate) emergency: Arc<EmergencyOverride>,
    pub(crate) engine: Arc<EnforcementEngine>,
    pub(crate) orchestrator: Arc<InstallOrchestrator>,
    updater: AutoUpdater,
    profile_label: String,
}

impl Agent {
    pub fn new(parts: AgentParts) -> Self {
        let AgentParts {
            config,
            store,
            clock,
            provider,
            installer,
            backend,
            telemetry,
        } = parts;

        let classification =
            DeviceProfileClassifier::with_rules(&config.profiles).classify(&config.device_profile());
        let profile_label = classification.label().to_string();
        let breaker = Arc::new(SafetyCircuitBreaker::new(
            store.clone(),
            clock.clone(),
            &classification,
            BreakerSettings::from_config(&config.safety),
        ));
        let emergency = Arc::new(EmergencyOverride::new(
            store.clone(),
            clock.clone(),
            config.emergency.default_duration_minutes,
        ));
        let engine = Arc::new(EnforcementEngine::new(
            provider,
            classification,
            breaker.clone(),
            emergency.clone(),
            PolicyStore::new(store),
        ));
        let orchestrator = Arc::new(InstallOrchestrator::new(
            engine.clone(),
            installer,
            backend.clone(),
            InstallSettings::from_config(&config),
        ));
        let updater = AutoUpdater::new(
            orchestrator.clone(),
            backend.clone(),
            Duration::from_secs(config.install.update_spacing_secs),
            config.backend.read_timeout(),
        );

        info!(
            device = %config.device.device_id,
            profile = %profile_label,
            "agent assembled"
        );
        Self {
            config,
            clock,
            backend,
            telemetry,
            breaker,
            emergency,
            engine,
            orchestrator,
            updater,
            profile_label,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.config.device.device_id
    }

    pub fn engine(&self) -> &Arc<EnforcementEngine> {
        &self.engine
    }

    pub fn breaker(&self) -> &Arc<SafetyCircuitBreaker> {
        &self.breaker
    }

    pub fn emergency(&self) -> &Arc<EmergencyOverride> {
        &self.emergency
    }

    /// Boot handling: breaker bookkeeping and gates first, then the delayed
    /// re-apply, sync and registration. Errors trip the breaker.
    pub async fn on_boot(&self) -> BootReport {
        let mut report = BootReport::default();
        if let Err(err) = self.boot_sequence(&mut report).await {
            let reason = format!("{err:#}");
            error!(%reason, "boot sequence failed");
            match self.breaker.trip(TripReason::BootFailure(reason.clone())) {
                Ok(outcome) => report.trips.push(outcome),
                Err(trip_err) => error!(error = %trip_err, "could not record safe mode trip"),
            }
            report.error = Some(reason);
        }
        report
    }

    async fn boot_sequence(&self, report: &mut BootReport) -> Result<()> {
        info!(profile = %self.profile_label, "boot sequence started");
        if let Some(trip) = self.breaker.register_boot()? {
            report.trips.push(trip);
        }
        if let Some(trip) = self.breaker.check_battery(self.telemetry.battery_percent())? {
            report.trips.push(trip);
        }

        if !self.engine.is_device_owner() {
            warn!("not device owner; enforcement disabled for this boot");
            report.halted = Some(BootHalt::NotDeviceOwner);
            return Ok(());
        }
        if self.emergency.is_active()? {
            info!("emergency unlock active at boot; policy left cleared");
            report.halted = Some(BootHalt::EmergencyActive);
            return Ok(());
        }
        if self.breaker.is_active()? {
            warn!("safe mode active at boot; policy not re-applied");
            report.halted = Some(BootHalt::SafeMode);
            return Ok(());
        }

        let boot = &self.config.boot;
        let reapply_at = Duration::from_secs(boot.policy_reapply_delay_secs);
        let sync_at = Duration::from_secs(boot.sync_delay_secs);
        let register_at = Duration::from_secs(boot.register_delay_secs);

        tokio::time::sleep(reapply_at).await;
        report.reapplied = self
            .engine
            .reapply_current_policy()
            .context("re-apply stored policy")?;
        if let Some(outcome) = &report.reapplied {
            info!(%outcome, "stored policy re-applied at boot");
        }

        tokio::time::sleep(sync_at.saturating_sub(reapply_at)).await;
        match self.sync_once().await {
            Ok(_) => report.synced = true,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "boot sync failed");
            }
        }

        tokio::time::sleep(register_at.saturating_sub(sync_at)).await;
        report.registered = self.register_device().await;
        Ok(())
    }

    pub async fn register_device(&self) -> bool {
        let hardware = self.config.hardware_info();
        let call = self.backend.register_device(self.device_id(), &hardware);
        match tokio::time::timeout(self.config.backend.read_timeout(), call).await {
            Ok(Ok(registered)) => {
                info!(registered, "device registration sent");
                registered
            }
            Ok(Err(err)) => {
                warn!(error = %err, "device registration failed");
                false
            }
            Err(_) => {
                warn!("device registration timed out");
                false
            }
        }
    }

    /// Validate `code` and, when granted, clear the device and open the window.
    pub async fn unlock_emergency(&self, code: &str) -> Result<UnlockOutcome> {
        let outcome = self
            .emergency
            .authorize(
                self.device_id(),
                code,
                self.backend.as_ref(),
                self.config.backend.read_timeout(),
            )
            .await;
        match &outcome {
            UnlockOutcome::Granted {
                duration_minutes,
                source,
            } => {
                let window = self.engine.activate_emergency(*duration_minutes)?;
                info!(?source, until = %window.unlock_until, "emergency unlock granted");
            }
            UnlockOutcome::Rejected { reason } => warn!(%reason, "emergency unlock rejected"),
        }
        Ok(outcome)
    }

    /// Close the window early and sync so restrictions come back.
    pub async fn end_emergency(&self) -> Result<Option<SyncCycleResult>> {
        self.emergency.deactivate()?;
        match self.sync_once().await {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "sync after emergency failed");
                Ok(None)
            }
        }
    }

    pub fn reset_safe_mode(&self) -> Result<SafeModeState> {
        self.breaker.reset()
    }

    pub async fn install_app(&self, app_id: &str) -> Result<InstallReport> {
        let job = self.orchestrator.resolve_job(self.device_id(), app_id).await?;
        Ok(self.orchestrator.run(job).await)
    }

    pub async fn check_updates(&self) -> Result<Vec<InstallReport>> {
        self.updater.check_and_apply(self.device_id()).await
    }

    pub fn status(&self) -> Result<AgentStatus> {
        let policy = self.engine.current_policy()?;
        Ok(AgentStatus {
            device_id: self.device_id().to_string(),
            device_owner: self.engine.is_device_owner(),
            policy_name: policy.as_ref().map(|policy| policy.name.clone()),
            blocked_apps: policy
                .map(|policy| policy.blocked_packages().into_iter().collect())
                .unwrap_or_default(),
            safety: SafetyReport::collect(&self.profile_label, &self.breaker, &self.emergency, self.clock.now())?,
        })
    }

    pub fn telemetry_report(&self) -> Result<TelemetryReport> {
        Ok(TelemetryReport {
            battery_percent: self.telemetry.battery_percent(),
            location: self.telemetry.last_location(),
            safe_mode: self.breaker.is_active()?,
            emergency_active: self.emergency.is_active()?,
            policy_name: self.engine.current_policy()?.map(|policy| policy.name),
            reported_at: self.clock.now(),
        })
    }

    pub async fn report_telemetry(&self) -> Result<()> {
        if !self.engine.is_device_owner() {
            return Err(anyhow!("not device owner; telemetry skipped"));
        }
        let report = self.telemetry_report()?;
        tokio::time::timeout(
            self.config.backend.read_timeout(),
            self.backend.report_telemetry(self.device_id(), &report),
        )
        .await
        .map_err(|_| anyhow!("telemetry report timed out"))?
        .context("report telemetry")
    }
}
