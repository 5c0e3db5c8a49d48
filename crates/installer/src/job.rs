use std::fmt;

use serde::Serialize;

use devicewarden_core::backend::{AppDescriptor, SpecialConfig};
use devicewarden_core::ids::JobId;
use policy_engine::OperationReport;

/// Stages a job moves through. `Restoring` is entered on every path that
/// got past the restriction snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Requested,
    Preparing,
    Downloading,
    Installing,
    Verifying,
    Restoring,
    Succeeded,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            JobState::Requested => "requested",
            JobState::Preparing => "preparing",
            JobState::Downloading => "downloading",
            JobState::Installing => "installing",
            JobState::Verifying => "verifying",
            JobState::Restoring => "restoring",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        };
        write!(f, "{value}")
    }
}

/// One install attempt. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallationJob {
    pub id: JobId,
    pub app_id: String,
    pub package_name: String,
    pub name: String,
    pub category: String,
    pub version_code: i64,
    pub required_permissions: Vec<String>,
    pub special_config: SpecialConfig,
}

impl InstallationJob {
    pub fn from_app(app: &AppDescriptor) -> Self {
        Self {
            id: JobId::new(),
            app_id: app.id.clone(),
            package_name: app.package_name.clone(),
            name: app.name.clone(),
            category: app.category.clone(),
            version_code: app.version.code,
            required_permissions: app.required_permissions.clone(),
            special_config: app.special_config,
        }
    }

    /// Delivery apps and overlay apps get the full delivery bundle.
    pub fn wants_delivery_setup(&self) -> bool {
        self.category.eq_ignore_ascii_case("delivery") || self.special_config.grant_overlay_permission
    }
}

/// Which signal settled the Verifying stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    /// The completion callback reported success, or the package resolved.
    Confirmed,
    /// Nothing conclusive yet; the package manager may still finish.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallReport {
    pub job_id: JobId,
    pub package_name: String,
    pub states: Vec<JobState>,
    pub verification: Option<Verification>,
    pub used_fallback: bool,
    pub restored: bool,
    pub grants: Option<OperationReport>,
    pub error: Option<String>,
    pub failure_class: Option<String>,
}

impl InstallReport {
    pub(crate) fn new(job: &InstallationJob) -> Self {
        Self {
            job_id: job.id,
            package_name: job.package_name.clone(),
            states: vec![JobState::Requested],
            verification: None,
            used_fallback: false,
            restored: false,
            grants: None,
            error: None,
            failure_class: None,
        }
    }

    pub(crate) fn enter(&mut self, state: JobState) {
        tracing::debug!(job = %self.job_id, package = %self.package_name, %state, "install job state");
        self.states.push(state);
    }

    pub fn final_state(&self) -> JobState {
        self.states.last().copied().unwrap_or(JobState::Requested)
    }

    pub fn succeeded(&self) -> bool {
        self.final_state() == JobState::Succeeded
    }

    pub fn visited(&self, state: JobState) -> bool {
        self.states.contains(&state)
    }

    pub fn summary(&self) -> String {
        match (&self.error, self.verification) {
            (Some(error), _) => format!("install of {} failed: {error}", self.package_name),
            (None, Some(Verification::Pending)) => {
                format!("install of {} submitted; completion pending", self.package_name)
            }
            (None, _) => format!("{} installed", self.package_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicewarden_core::backend::AppVersion;

    #[test]
    fn test_job_from_descriptor() {
        let app = AppDescriptor {
            id: "a1".to_string(),
            package_name: "com.example.rider".to_string(),
            name: "Rider".to_string(),
            description: String::new(),
            category: "Delivery".to_string(),
            version: AppVersion {
                name: "2.0".to_string(),
                code: 20,
            },
            required_permissions: vec!["android.permission.CAMERA".to_string()],
            special_config: SpecialConfig::default(),
        };
        let job = InstallationJob::from_app(&app);
        assert_eq!(job.package_name, "com.example.rider");
        assert_eq!(job.version_code, 20);
        assert!(job.wants_delivery_setup());

        let report = InstallReport::new(&job);
        assert_eq!(report.final_state(), JobState::Requested);
        assert!(!report.succeeded());
    }
}
