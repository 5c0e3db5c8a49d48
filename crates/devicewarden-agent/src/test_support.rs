use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use devicewarden_core::backend::{
    AppDescriptor, AppVersion, Backend, DownloadProgress, EmergencyValidation, HardwareInfo,
    SpecialConfig, SyncResponse,
};
use devicewarden_core::clock::ManualClock;
use devicewarden_core::config::Config;
use devicewarden_core::package::{
    CommandOutput, InstallCallback, InstallError, InstallStatus, PackageInstaller, SessionHandle,
};
use devicewarden_core::policy::{AppCategory, PolicyDocument};
use devicewarden_core::provider::{InMemoryProvider, RestrictionProvider};
use devicewarden_core::restrictions::toggles;
use devicewarden_core::store::MemoryStore;
use devicewarden_core::telemetry::{Location, TelemetryReport, TelemetrySource};

use crate::agent::{Agent, AgentParts};

pub fn test_config() -> Config {
    let mut config = Config::default_config();
    config.device.device_id = "device-1".to_string();
    config.device.manufacturer = "google".to_string();
    config.device.model = "pixel 8".to_string();
    config.install.settle_delay_ms = 1;
    config.install.verify_delay_ms = 1;
    config.install.grant_delay_ms = 1;
    config.install.update_spacing_secs = 0;
    config
}

pub fn sample_policy() -> PolicyDocument {
    let mut policy = PolicyDocument {
        name: "field-staff".to_string(),
        ..PolicyDocument::default()
    };
    for toggle in [toggles::BLOCK_HOTSPOT, toggles::BLOCK_USB, toggles::BLOCK_CAMERA] {
        policy.system_restrictions.insert(toggle.to_string(), true);
    }
    policy.blocked_apps.social_media = AppCategory {
        enabled: true,
        apps: vec!["com.facebook.katana".to_string()],
    };
    policy
}

pub fn enforcing(policy: Option<PolicyDocument>) -> SyncResponse {
    SyncResponse {
        success: true,
        enforcement_enabled: true,
        policy,
        ..SyncResponse::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportedCommand {
    pub command: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct BackendState {
    responses: VecDeque<Result<SyncResponse, String>>,
    syncs: usize,
    sent_blocked_apps: Vec<Vec<String>>,
    reported: Vec<ReportedCommand>,
    validation: Option<EmergencyValidation>,
    validations: usize,
    registrations: usize,
    telemetry: Vec<TelemetryReport>,
}

/// Backend double. Sync calls pop queued responses and fall back to an
/// enforcing response without policy once the queue is empty.
pub struct FakeBackend {
    dir: TempDir,
    apps: Vec<AppDescriptor>,
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new(apps: Vec<AppDescriptor>) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            apps,
            state: Mutex::new(BackendState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    pub fn push_sync(&self, response: SyncResponse) {
        self.state().responses.push_back(Ok(response));
    }

    pub fn push_sync_error(&self, reason: &str) {
        self.state().responses.push_back(Err(reason.to_string()));
    }

    pub fn set_validation(&self, validation: EmergencyValidation) {
        self.state().validation = Some(validation);
    }

    pub fn syncs(&self) -> usize {
        self.state().syncs
    }

    pub fn validations(&self) -> usize {
        self.state().validations
    }

    pub fn registrations(&self) -> usize {
        self.state().registrations
    }

    pub fn reported(&self) -> Vec<ReportedCommand> {
        self.state().reported.clone()
    }

    pub fn sent_blocked_apps(&self) -> Vec<Vec<String>> {
        self.state().sent_blocked_apps.clone()
    }

    pub fn telemetry(&self) -> Vec<TelemetryReport> {
        self.state().telemetry.clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn register_device(&self, _device_id: &str, _hardware: &HardwareInfo) -> Result<bool> {
        self.state().registrations += 1;
        Ok(true)
    }

    async fn sync_policies(&self, _device_id: &str, blocked_apps: &[String]) -> Result<SyncResponse> {
        let next = {
            let mut state = self.state();
            state.syncs += 1;
            state.sent_blocked_apps.push(blocked_apps.to_vec());
            state.responses.pop_front()
        };
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(reason)) => bail!(reason),
            None => Ok(enforcing(None)),
        }
    }

    async fn report_command_executed(
        &self,
        _device_id: &str,
        command: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        self.state().reported.push(ReportedCommand {
            command: command.to_string(),
            success,
            error: error.map(str::to_string),
        });
        Ok(())
    }

    async fn validate_emergency_code(&self, _device_id: &str, _code: &str) -> Result<EmergencyValidation> {
        let mut state = self.state();
        state.validations += 1;
        match state.validation.clone() {
            Some(validation) => Ok(validation),
            None => bail!("validation endpoint unreachable"),
        }
    }

    async fn list_available_apps(&self, _device_id: &str) -> Result<Vec<AppDescriptor>> {
        Ok(self.apps.clone())
    }

    async fn download_artifact(
        &self,
        app_id: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf> {
        let bytes = vec![3u8; 96 * 1024];
        let path = self.dir.path().join(format!("{app_id}.apk"));
        std::fs::write(&path, &bytes)?;
        progress(DownloadProgress {
            downloaded: bytes.len() as u64,
            total: Some(bytes.len() as u64),
        });
        Ok(path)
    }

    async fn report_telemetry(&self, _device_id: &str, report: &TelemetryReport) -> Result<()> {
        self.state().telemetry.push(report.clone());
        Ok(())
    }
}

/// Installer that always succeeds and records the package in the provider.
pub struct FakeInstaller {
    provider: Arc<InMemoryProvider>,
    sessions: Mutex<Vec<String>>,
}

impl FakeInstaller {
    pub fn new(provider: Arc<InMemoryProvider>) -> Self {
        Self {
            provider,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn installs(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn create_session(&self, package: &str) -> Result<SessionHandle, InstallError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(package.to_string());
        Ok(SessionHandle(sessions.len() as u64))
    }

    async fn write(&self, _session: SessionHandle, _chunk: &[u8]) -> Result<(), InstallError> {
        Ok(())
    }

    async fn commit(&self, session: SessionHandle, on_result: InstallCallback) -> Result<(), InstallError> {
        let package = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(session.0 as usize - 1).cloned()
        };
        if let Some(package) = package {
            self.provider.install(&package);
        }
        on_result(InstallStatus::Success);
        Ok(())
    }

    async fn abandon(&self, _session: SessionHandle) {}

    async fn install_from_path(&self, _path: &Path) -> Result<CommandOutput, InstallError> {
        Err(InstallError::Session("no shell in tests".to_string()))
    }

    fn is_installed(&self, package: &str) -> bool {
        self.provider.is_application_installed(package)
    }

    fn installed_version(&self, package: &str) -> Option<i64> {
        self.is_installed(package).then_some(1)
    }
}

/// Sensor readings that tests can change between calls.
#[derive(Default)]
pub struct FakeTelemetry {
    battery: Mutex<Option<u8>>,
}

impl FakeTelemetry {
    pub fn set_battery(&self, percent: Option<u8>) {
        *self.battery.lock().unwrap() = percent;
    }
}

impl TelemetrySource for FakeTelemetry {
    fn battery_percent(&self) -> Option<u8> {
        *self.battery.lock().unwrap()
    }

    fn last_location(&self) -> Option<Location> {
        None
    }
}

pub struct TestAgent {
    pub agent: Arc<Agent>,
    pub provider: Arc<InMemoryProvider>,
    pub backend: Arc<FakeBackend>,
    pub installer: Arc<FakeInstaller>,
    pub telemetry: Arc<FakeTelemetry>,
    pub clock: Arc<ManualClock>,
}

impl TestAgent {
    pub fn restrictions(&self) -> BTreeSet<String> {
        self.provider.active_restrictions()
    }
}

pub fn rider_app() -> AppDescriptor {
    AppDescriptor {
        id: "a1".to_string(),
        package_name: "com.example.rider".to_string(),
        name: "Rider".to_string(),
        description: String::new(),
        category: "delivery".to_string(),
        version: AppVersion {
            name: "2.0".to_string(),
            code: 20,
        },
        required_permissions: Vec::new(),
        special_config: SpecialConfig {
            auto_update: true,
            ..SpecialConfig::default()
        },
    }
}

pub fn create_test_agent(config: Config) -> TestAgent {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let provider = Arc::new(InMemoryProvider::with_installed([
        "com.facebook.katana",
        "com.android.chrome",
    ]));
    let backend = Arc::new(FakeBackend::new(vec![rider_app()]));
    let installer = Arc::new(FakeInstaller::new(provider.clone()));
    let telemetry = Arc::new(FakeTelemetry::default());

    let agent = Agent::new(AgentParts {
        config,
        store,
        clock: clock.clone(),
        provider: provider.clone(),
        installer: installer.clone(),
        backend: backend.clone(),
        telemetry: telemetry.clone(),
    });

    TestAgent {
        agent: Arc::new(agent),
        provider,
        backend,
        installer,
        telemetry,
        clock,
    }
}
