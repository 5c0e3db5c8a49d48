use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use devicewarden_core::backend::{
    AppDescriptor, AppVersion, Backend, DownloadProgress, EmergencyValidation, HardwareInfo,
    SpecialConfig, SyncResponse,
};
use devicewarden_core::clock::ManualClock;
use devicewarden_core::package::{
    CommandOutput, InstallCallback, InstallError, InstallStatus, PackageInstaller, SessionHandle,
};
use devicewarden_core::policy::PolicyDocument;
use devicewarden_core::profile::ProfileClassification;
use devicewarden_core::provider::{InMemoryProvider, RestrictionProvider};
use devicewarden_core::restrictions::toggles;
use devicewarden_core::store::MemoryStore;
use devicewarden_core::telemetry::TelemetryReport;
use policy_engine::{EnforcementEngine, PolicyStore};
use safety::{BreakerSettings, EmergencyOverride, SafetyCircuitBreaker};

use crate::orchestrator::{InstallOrchestrator, InstallSettings};

pub fn app(id: &str, package: &str, category: &str, code: i64) -> AppDescriptor {
    AppDescriptor {
        id: id.to_string(),
        package_name: package.to_string(),
        name: package.to_string(),
        description: String::new(),
        category: category.to_string(),
        version: AppVersion {
            name: format!("{code}.0"),
            code,
        },
        required_permissions: Vec::new(),
        special_config: SpecialConfig::default(),
    }
}

pub fn blocking_policy() -> PolicyDocument {
    let mut policy = PolicyDocument {
        name: "locked-down".to_string(),
        ..PolicyDocument::default()
    };
    policy
        .system_restrictions
        .insert(toggles::BLOCK_INSTALLATION.to_string(), true);
    policy.system_restrictions.insert(toggles::BLOCK_USB.to_string(), true);
    policy
}

struct InstallerState {
    session_error: Option<InstallError>,
    write_error: bool,
    commit_status: Option<InstallStatus>,
    fallback_output: CommandOutput,
    sessions: BTreeMap<u64, String>,
    versions: BTreeMap<String, i64>,
    bytes_written: usize,
    writes: usize,
    abandoned: usize,
    fallback_calls: usize,
}

/// Package manager double. Successful installs land in the shared provider
/// so the engine can grant permissions afterwards.
pub struct FakeInstaller {
    provider: Arc<InMemoryProvider>,
    fallback_package: String,
    state: Mutex<InstallerState>,
}

impl FakeInstaller {
    pub fn new(provider: Arc<InMemoryProvider>, fallback_package: &str) -> Self {
        Self {
            provider,
            fallback_package: fallback_package.to_string(),
            state: Mutex::new(InstallerState {
                session_error: None,
                write_error: false,
                commit_status: Some(InstallStatus::Success),
                fallback_output: CommandOutput {
                    exit_code: 0,
                    stdout: "Success".to_string(),
                    stderr: String::new(),
                },
                sessions: BTreeMap::new(),
                versions: BTreeMap::new(),
                bytes_written: 0,
                writes: 0,
                abandoned: 0,
                fallback_calls: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InstallerState> {
        self.state.lock().unwrap()
    }

    pub fn fail_sessions(&self, error: InstallError) {
        self.state().session_error = Some(error);
    }

    pub fn fail_writes(&self) {
        self.state().write_error = true;
    }

    /// `None` means the completion callback never fires.
    pub fn set_commit_status(&self, status: Option<InstallStatus>) {
        self.state().commit_status = status;
    }

    pub fn set_fallback_output(&self, output: CommandOutput) {
        self.state().fallback_output = output;
    }

    pub fn set_installed_version(&self, package: &str, code: i64) {
        self.state().versions.insert(package.to_string(), code);
    }

    pub fn bytes_written(&self) -> usize {
        self.state().bytes_written
    }

    pub fn writes(&self) -> usize {
        self.state().writes
    }

    pub fn abandoned(&self) -> usize {
        self.state().abandoned
    }

    pub fn fallback_calls(&self) -> usize {
        self.state().fallback_calls
    }

    fn mark_installed(&self, package: &str) {
        self.provider.install(package);
        self.state().versions.insert(package.to_string(), 20);
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    async fn create_session(&self, package: &str) -> Result<SessionHandle, InstallError> {
        let mut state = self.state();
        if let Some(error) = &state.session_error {
            return Err(error.clone());
        }
        let id = state.sessions.len() as u64 + 1;
        state.sessions.insert(id, package.to_string());
        Ok(SessionHandle(id))
    }

    async fn write(&self, _session: SessionHandle, chunk: &[u8]) -> Result<(), InstallError> {
        let mut state = self.state();
        if state.write_error {
            return Err(InstallError::Session("stream closed".to_string()));
        }
        state.bytes_written += chunk.len();
        state.writes += 1;
        Ok(())
    }

    async fn commit(&self, session: SessionHandle, on_result: InstallCallback) -> Result<(), InstallError> {
        let (status, package) = {
            let state = self.state();
            (state.commit_status.clone(), state.sessions.get(&session.0).cloned())
        };
        if let (Some(InstallStatus::Success), Some(package)) = (&status, &package) {
            self.mark_installed(package);
        }
        if let Some(status) = status {
            on_result(status);
        }
        Ok(())
    }

    async fn abandon(&self, session: SessionHandle) {
        let mut state = self.state();
        state.sessions.remove(&session.0);
        state.abandoned += 1;
    }

    async fn install_from_path(&self, _path: &Path) -> Result<CommandOutput, InstallError> {
        let output = {
            let mut state = self.state();
            state.fallback_calls += 1;
            state.fallback_output.clone()
        };
        if output.succeeded() {
            self.mark_installed(&self.fallback_package);
        }
        Ok(output)
    }

    fn is_installed(&self, package: &str) -> bool {
        self.provider.is_application_installed(package)
    }

    fn installed_version(&self, package: &str) -> Option<i64> {
        self.state().versions.get(package).copied()
    }
}

/// Backend double serving a fixed catalogue and writing artifacts to a temp dir.
pub struct FakeBackend {
    dir: TempDir,
    apps: Vec<AppDescriptor>,
    download_error: Mutex<Option<String>>,
    downloads: Mutex<Vec<PathBuf>>,
}

impl FakeBackend {
    pub fn new(apps: Vec<AppDescriptor>) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            apps,
            download_error: Mutex::new(None),
            downloads: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_downloads(&self, reason: &str) {
        *self.download_error.lock().unwrap() = Some(reason.to_string());
    }

    pub fn downloads(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }

    pub fn last_artifact(&self) -> PathBuf {
        self.downloads.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn register_device(&self, _device_id: &str, _hardware: &HardwareInfo) -> Result<bool> {
        Ok(true)
    }

    async fn sync_policies(&self, _device_id: &str, _blocked_apps: &[String]) -> Result<SyncResponse> {
        Ok(SyncResponse::default())
    }

    async fn report_command_executed(
        &self,
        _device_id: &str,
        _command: &str,
        _success: bool,
        _error: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    async fn validate_emergency_code(&self, _device_id: &str, _code: &str) -> Result<EmergencyValidation> {
        bail!("not served")
    }

    async fn list_available_apps(&self, _device_id: &str) -> Result<Vec<AppDescriptor>> {
        Ok(self.apps.clone())
    }

    async fn download_artifact(
        &self,
        app_id: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf> {
        if let Some(reason) = self.download_error.lock().unwrap().clone() {
            bail!(reason);
        }
        let bytes = vec![7u8; 150 * 1024];
        let path = self.dir.path().join(format!("{app_id}.apk"));
        std::fs::write(&path, &bytes)?;
        progress(DownloadProgress {
            downloaded: bytes.len() as u64,
            total: Some(bytes.len() as u64),
        });
        self.downloads.lock().unwrap().push(path.clone());
        Ok(path)
    }

    async fn report_telemetry(&self, _device_id: &str, _report: &TelemetryReport) -> Result<()> {
        Ok(())
    }
}

pub struct TestRig {
    pub provider: Arc<InMemoryProvider>,
    pub engine: Arc<EnforcementEngine>,
    pub installer: Arc<FakeInstaller>,
    pub backend: Arc<FakeBackend>,
    pub orchestrator: Arc<InstallOrchestrator>,
}

pub fn create_test_rig() -> TestRig {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let classification = ProfileClassification::default();
    let provider = Arc::new(InMemoryProvider::new());
    let breaker = Arc::new(SafetyCircuitBreaker::new(
        store.clone(),
        clock.clone(),
        &classification,
        BreakerSettings::default(),
    ));
    let emergency = Arc::new(EmergencyOverride::new(store.clone(), clock, 30));
    let engine = Arc::new(EnforcementEngine::new(
        provider.clone(),
        classification,
        breaker,
        emergency,
        PolicyStore::new(store),
    ));

    let mut rider = app("a1", "com.example.rider", "delivery", 20);
    rider.special_config.auto_update = true;
    let backend = Arc::new(FakeBackend::new(vec![rider]));
    let installer = Arc::new(FakeInstaller::new(provider.clone(), "com.example.rider"));
    let settings = InstallSettings {
        settle_delay: Duration::from_millis(1),
        verify_delay: Duration::from_millis(1),
        grant_delay: Duration::from_millis(1),
        chunk_size: 64 * 1024,
        download_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(5),
    };
    let orchestrator = Arc::new(InstallOrchestrator::new(
        engine.clone(),
        installer.clone(),
        backend.clone(),
        settings,
    ));

    TestRig {
        provider,
        engine,
        installer,
        backend,
        orchestrator,
    }
}
