use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use devicewarden_core::backend::{AppDescriptor, Backend};
use devicewarden_core::package::PackageInstaller;

use crate::job::{InstallReport, InstallationJob};
use crate::orchestrator::InstallOrchestrator;

/// Catalogue apps flagged for auto-update whose installed version is older
/// than the server's. Apps that are not installed are left alone.
pub fn pending_updates(apps: &[AppDescriptor], installer: &dyn PackageInstaller) -> Vec<AppDescriptor> {
    apps.iter()
        .filter(|app| app.special_config.auto_update)
        .filter(|app| match installer.installed_version(&app.package_name) {
            Some(installed) => installed < app.version.code,
            None => false,
        })
        .cloned()
        .collect()
}

pub struct AutoUpdater {
    orchestrator: Arc<InstallOrchestrator>,
    backend: Arc<dyn Backend>,
    spacing: Duration,
    read_timeout: Duration,
}

impl AutoUpdater {
    pub fn new(
        orchestrator: Arc<InstallOrchestrator>,
        backend: Arc<dyn Backend>,
        spacing: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            backend,
            spacing,
            read_timeout,
        }
    }

    /// Install every pending update, one at a time with `spacing` between them.
    pub async fn check_and_apply(&self, device_id: &str) -> Result<Vec<InstallReport>> {
        let apps = tokio::time::timeout(self.read_timeout, self.backend.list_available_apps(device_id))
            .await
            .map_err(|_| anyhow!("listing available apps timed out"))?
            .context("list available apps")?;
        let due = pending_updates(&apps, self.orchestrator.installer().as_ref());
        if due.is_empty() {
            debug!(catalogue = apps.len(), "no app updates due");
            return Ok(Vec::new());
        }

        info!(updates = due.len(), "applying app updates");
        let mut reports = Vec::with_capacity(due.len());
        for (index, app) in due.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.spacing).await;
            }
            reports.push(self.orchestrator.run(InstallationJob::from_app(app)).await);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{app, create_test_rig};

    #[test]
    fn test_pending_updates_only_newer_flagged_apps() {
        let rig = create_test_rig();
        rig.installer.set_installed_version("com.example.rider", 10);
        rig.installer.set_installed_version("com.example.maps", 30);

        let mut rider = app("a1", "com.example.rider", "delivery", 20);
        rider.special_config.auto_update = true;
        let mut maps = app("a2", "com.example.maps", "tools", 30);
        maps.special_config.auto_update = true;
        let mut absent = app("a3", "com.example.absent", "tools", 99);
        absent.special_config.auto_update = true;
        let unflagged = app("a4", "com.example.chat", "tools", 99);

        let due = pending_updates(&[rider, maps, absent, unflagged], &*rig.installer);
        let packages: Vec<&str> = due.iter().map(|app| app.package_name.as_str()).collect();
        assert_eq!(packages, vec!["com.example.rider"]);
    }

    #[tokio::test]
    async fn test_check_and_apply_runs_due_updates() {
        let rig = create_test_rig();
        rig.installer.set_installed_version("com.example.rider", 10);
        let updater = AutoUpdater::new(
            rig.orchestrator.clone(),
            rig.backend.clone(),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );

        let reports = updater.check_and_apply("device-1").await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].succeeded());
        assert_eq!(rig.backend.downloads(), 1);
    }
}
