use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use devicewarden_core::backend::{Backend, DownloadProgress};
use devicewarden_core::config::Config;
use devicewarden_core::package::{InstallError, InstallStatus, PackageInstaller, SessionHandle};
use devicewarden_core::policy::DeliveryApp;
use devicewarden_core::provider::SpecialAccess;
use policy_engine::{EnforcementEngine, OperationReport, RestrictionSnapshot};

use crate::job::{InstallReport, InstallationJob, JobState, Verification};

#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub settle_delay: Duration,
    pub verify_delay: Duration,
    pub grant_delay: Duration,
    pub chunk_size: usize,
    pub download_timeout: Duration,
    pub read_timeout: Duration,
}

impl InstallSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settle_delay: Duration::from_millis(config.install.settle_delay_ms),
            verify_delay: Duration::from_millis(config.install.verify_delay_ms),
            grant_delay: Duration::from_millis(config.install.grant_delay_ms),
            chunk_size: config.install.chunk_size.max(1),
            download_timeout: config.backend.download_timeout(),
            read_timeout: config.backend.read_timeout(),
        }
    }
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self::from_config(&Config::default_config())
    }
}

/// Drives one application artifact from download to verified install while
/// holding the device's restriction set open only for as long as needed.
pub struct InstallOrchestrator {
    engine: Arc<EnforcementEngine>,
    installer: Arc<dyn PackageInstaller>,
    backend: Arc<dyn Backend>,
    settings: InstallSettings,
    jobs: Mutex<()>,
}

impl InstallOrchestrator {
    pub fn new(
        engine: Arc<EnforcementEngine>,
        installer: Arc<dyn PackageInstaller>,
        backend: Arc<dyn Backend>,
        settings: InstallSettings,
    ) -> Self {
        Self {
            engine,
            installer,
            backend,
            settings,
            jobs: Mutex::new(()),
        }
    }

    pub fn installer(&self) -> &Arc<dyn PackageInstaller> {
        &self.installer
    }

    /// Look `app_id` up in the backend catalogue.
    pub async fn resolve_job(&self, device_id: &str, app_id: &str) -> Result<InstallationJob> {
        let apps = tokio::time::timeout(
            self.settings.read_timeout,
            self.backend.list_available_apps(device_id),
        )
        .await
        .map_err(|_| anyhow!("listing available apps timed out"))?
        .context("list available apps")?;
        apps.iter()
            .find(|app| app.id == app_id)
            .map(InstallationJob::from_app)
            .ok_or_else(|| anyhow!("app {app_id} is not in the catalogue"))
    }

    /// Run `job` to completion. Jobs are serialized; a second caller waits.
    pub async fn run(&self, job: InstallationJob) -> InstallReport {
        let _running = self.jobs.lock().await;
        let mut report = InstallReport::new(&job);
        info!(job = %job.id, package = %job.package_name, "install job requested");

        let snapshot = match self.engine.snapshot_restrictions(&job.package_name) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                fail(&mut report, &err);
                return report;
            }
        };
        let guard = RestoreGuard::new(&self.engine, snapshot);

        let result = self.drive(&job, &mut report).await;

        report.enter(JobState::Restoring);
        report.restored = guard.restore();

        match result {
            Ok(verification) => {
                report.verification = Some(verification);
                if verification == Verification::Confirmed {
                    tokio::time::sleep(self.settings.grant_delay).await;
                    match self.grant(&job) {
                        Ok(grants) => report.grants = Some(grants),
                        Err(err) => warn!(package = %job.package_name, error = %err, "post-install grants failed"),
                    }
                } else {
                    info!(package = %job.package_name, "install pending; grants deferred");
                }
                report.enter(JobState::Succeeded);
                info!(job = %job.id, package = %job.package_name, ?verification, "install job finished");
            }
            Err(err) => fail(&mut report, &err),
        }
        report
    }

    async fn drive(&self, job: &InstallationJob, report: &mut InstallReport) -> Result<Verification> {
        report.enter(JobState::Preparing);
        self.prepare(job).await?;

        report.enter(JobState::Downloading);
        let artifact = self.download(job).await?;

        report.enter(JobState::Installing);
        let completion = self.install(job, artifact.path(), report).await?;

        report.enter(JobState::Verifying);
        self.verify(job, artifact.path(), completion, report).await
    }

    async fn prepare(&self, job: &InstallationJob) -> Result<()> {
        let relaxed = self.engine.relax_install_restrictions(&job.package_name)?;
        if !relaxed.is_clean() {
            warn!(skipped = relaxed.failures.len(), "install restrictions only partly relaxed");
        }
        tokio::time::sleep(self.settings.settle_delay).await;
        if self.engine.install_still_blocked()? {
            return Err(InstallError::Restricted(
                "install restriction still active after relaxing".to_string(),
            )
            .into());
        }
        Ok(())
    }

    async fn download(&self, job: &InstallationJob) -> Result<Artifact> {
        let package = job.package_name.clone();
        let progress = move |progress: DownloadProgress| {
            if let Some(percent) = progress.percent() {
                debug!(%package, percent, "download progress");
            }
        };
        let path = tokio::time::timeout(
            self.settings.download_timeout,
            self.backend.download_artifact(&job.app_id, &progress),
        )
        .await
        .map_err(|_| anyhow!("download of {} timed out", job.app_id))?
        .with_context(|| format!("download artifact {}", job.app_id))?;
        Ok(Artifact { path })
    }

    /// Session install first; on any error the command-line path runs once.
    /// Returns the completion signal when the session path committed.
    async fn install(
        &self,
        job: &InstallationJob,
        artifact: &Path,
        report: &mut InstallReport,
    ) -> Result<Option<oneshot::Receiver<InstallStatus>>> {
        match self.install_with_session(job, artifact).await {
            Ok(completion) => Ok(Some(completion)),
            Err(err) => {
                warn!(
                    package = %job.package_name,
                    class = err.class(),
                    error = %err,
                    "session install failed; using fallback"
                );
                report.used_fallback = true;
                self.install_fallback(job, artifact).await?;
                Ok(None)
            }
        }
    }

    async fn install_with_session(
        &self,
        job: &InstallationJob,
        artifact: &Path,
    ) -> Result<oneshot::Receiver<InstallStatus>, InstallError> {
        let mut file = File::open(artifact)
            .await
            .map_err(|err| InstallError::Io(format!("open {}: {err}", artifact.display())))?;
        let session = self.installer.create_session(&job.package_name).await?;
        let committed = self.stream_and_commit(session, &mut file, artifact).await;
        if committed.is_err() {
            self.installer.abandon(session).await;
        }
        committed
    }

    async fn stream_and_commit(
        &self,
        session: SessionHandle,
        file: &mut File,
        artifact: &Path,
    ) -> Result<oneshot::Receiver<InstallStatus>, InstallError> {
        let mut buffer = vec![0u8; self.settings.chunk_size.max(1)];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|err| InstallError::Io(format!("read {}: {err}", artifact.display())))?;
            if read == 0 {
                break;
            }
            self.installer.write(session, &buffer[..read]).await?;
        }
        let (sender, receiver) = oneshot::channel();
        self.installer
            .commit(
                session,
                Box::new(move |status| {
                    let _ = sender.send(status);
                }),
            )
            .await?;
        Ok(receiver)
    }

    async fn install_fallback(&self, job: &InstallationJob, artifact: &Path) -> Result<()> {
        let output = self.installer.install_from_path(artifact).await?;
        if output.succeeded() {
            info!(package = %job.package_name, "fallback install succeeded");
            Ok(())
        } else {
            let failure = output.failure();
            error!(package = %job.package_name, class = failure.class(), "fallback install failed");
            Err(failure.into())
        }
    }

    /// The completion callback wins when it has fired; otherwise the
    /// package probe decides between confirmed and pending.
    async fn verify(
        &self,
        job: &InstallationJob,
        artifact: &Path,
        completion: Option<oneshot::Receiver<InstallStatus>>,
        report: &mut InstallReport,
    ) -> Result<Verification> {
        tokio::time::sleep(self.settings.verify_delay).await;
        let status = completion.and_then(|mut receiver| receiver.try_recv().ok());

        match status.as_ref().and_then(InstallStatus::outcome) {
            Some(Ok(())) => Ok(Verification::Confirmed),
            Some(Err(err)) => {
                warn!(package = %job.package_name, class = err.class(), "package manager rejected session");
                if report.used_fallback {
                    return Err(err.into());
                }
                report.used_fallback = true;
                self.install_fallback(job, artifact).await?;
                Ok(self.probe(job))
            }
            None => Ok(self.probe(job)),
        }
    }

    fn probe(&self, job: &InstallationJob) -> Verification {
        if self.installer.is_installed(&job.package_name) {
            Verification::Confirmed
        } else {
            info!(package = %job.package_name, "package not resolvable yet; install likely pending");
            Verification::Pending
        }
    }

    fn grant(&self, job: &InstallationJob) -> Result<OperationReport> {
        let mut special = Vec::new();
        if job.special_config.disable_battery_optimization {
            special.push(SpecialAccess::BatteryOptimizationExempt);
        }
        if job.special_config.protect_in_background {
            special.push(SpecialAccess::BackgroundProtection);
        }

        if !job.wants_delivery_setup() {
            return self
                .engine
                .grant_permissions(&job.package_name, &job.required_permissions, &special);
        }

        let mut grants = self.engine.setup_delivery_app(&DeliveryApp {
            package_name: job.package_name.clone(),
            name: job.name.clone(),
            grant_overlay_permission: true,
            disable_battery_optimization: true,
            grant_all_permissions: true,
        })?;
        if !job.required_permissions.is_empty() {
            grants.merge(
                self.engine
                    .grant_permissions(&job.package_name, &job.required_permissions, &[])?,
            );
        }
        Ok(grants)
    }
}

fn fail(report: &mut InstallReport, err: &anyhow::Error) {
    let class = err
        .downcast_ref::<InstallError>()
        .map(InstallError::class)
        .unwrap_or("error");
    let message = format!("{err:#}");
    error!(job = %report.job_id, package = %report.package_name, class, error = %message, "install job failed");
    report.error = Some(message);
    report.failure_class = Some(class.to_string());
    report.enter(JobState::Failed);
}

/// Downloaded artifact, removed from disk when dropped.
struct Artifact {
    path: PathBuf,
}

impl Artifact {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %err, "artifact cleanup skipped");
        }
    }
}

/// Puts the restriction snapshot back on every exit, including unwinding
/// and a dropped job future.
struct RestoreGuard<'a> {
    engine: &'a EnforcementEngine,
    snapshot: Option<RestrictionSnapshot>,
}

impl<'a> RestoreGuard<'a> {
    fn new(engine: &'a EnforcementEngine, snapshot: RestrictionSnapshot) -> Self {
        Self {
            engine,
            snapshot: Some(snapshot),
        }
    }

    fn restore(mut self) -> bool {
        self.restore_now()
    }

    fn restore_now(&mut self) -> bool {
        let Some(snapshot) = self.snapshot.take() else {
            return true;
        };
        match self.engine.restore_restrictions(&snapshot) {
            Ok(report) if report.is_clean() => {
                info!(
                    restrictions = snapshot.restrictions.len(),
                    hidden = snapshot.hidden_apps.len(),
                    "restrictions restored"
                );
                true
            }
            Ok(report) => {
                warn!(skipped = report.failures.len(), "restrictions partly restored");
                false
            }
            Err(err) => {
                error!(error = %err, "could not restore restrictions");
                false
            }
        }
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if self.snapshot.is_some() {
            warn!("install job interrupted; restoring restrictions");
            self.restore_now();
        }
    }
}
