use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u64);

/// Final word from the package manager about a committed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Success,
    PendingUserAction,
    Failure(String),
    Blocked(String),
    Invalid(String),
    Conflict(String),
    Storage(String),
    Incompatible(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallError {
    #[error("installation restricted: {0}")]
    Restricted(String),
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),
    #[error("package already exists: {0}")]
    AlreadyExists(String),
    #[error("incompatible package: {0}")]
    Incompatible(String),
    #[error("invalid package: {0}")]
    InvalidPackage(String),
    #[error("conflicting package: {0}")]
    Conflict(String),
    #[error("install session failed: {0}")]
    Session(String),
    #[error("artifact io failed: {0}")]
    Io(String),
}

impl InstallError {
    /// Map package-manager output onto a failure class.
    pub fn classify(output: &str) -> Self {
        let detail = output.trim().to_string();
        if output.contains("INSTALL_FAILED_USER_RESTRICTED") {
            InstallError::Restricted(detail)
        } else if output.contains("INSTALL_FAILED_INSUFFICIENT_STORAGE") {
            InstallError::InsufficientStorage(detail)
        } else if output.contains("INSTALL_FAILED_ALREADY_EXISTS") {
            InstallError::AlreadyExists(detail)
        } else if output.contains("INSTALL_FAILED_CONFLICTING_PROVIDER")
            || output.contains("INSTALL_FAILED_UPDATE_INCOMPATIBLE")
        {
            InstallError::Conflict(detail)
        } else if output.contains("INSTALL_FAILED_OLDER_SDK")
            || output.contains("INSTALL_FAILED_NO_MATCHING_ABIS")
            || output.contains("INSTALL_FAILED_MISSING_SHARED_LIBRARY")
        {
            InstallError::Incompatible(detail)
        } else if output.contains("INSTALL_PARSE_FAILED") || output.contains("INSTALL_FAILED_INVALID_APK") {
            InstallError::InvalidPackage(detail)
        } else {
            InstallError::Session(detail)
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            InstallError::Restricted(_) => "user-restricted",
            InstallError::InsufficientStorage(_) => "insufficient-storage",
            InstallError::AlreadyExists(_) => "already-exists",
            InstallError::Incompatible(_) => "incompatible",
            InstallError::InvalidPackage(_) => "invalid-package",
            InstallError::Conflict(_) => "conflict",
            InstallError::Session(_) => "session",
            InstallError::Io(_) => "io",
        }
    }
}

impl InstallStatus {
    /// `None` while the outcome is still open.
    pub fn outcome(&self) -> Option<Result<(), InstallError>> {
        match self {
            InstallStatus::Success => Some(Ok(())),
            InstallStatus::PendingUserAction => None,
            InstallStatus::Failure(message) => Some(Err(InstallError::classify(message))),
            InstallStatus::Blocked(message) => Some(Err(InstallError::Restricted(message.clone()))),
            InstallStatus::Invalid(message) => Some(Err(InstallError::InvalidPackage(message.clone()))),
            InstallStatus::Conflict(message) => Some(Err(InstallError::Conflict(message.clone()))),
            InstallStatus::Storage(message) => {
                Some(Err(InstallError::InsufficientStorage(message.clone())))
            }
            InstallStatus::Incompatible(message) => {
                Some(Err(InstallError::Incompatible(message.clone())))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 || self.stdout.contains("Success")
    }

    pub fn failure(&self) -> InstallError {
        let combined = format!("{}\n{}", self.stderr, self.stdout);
        InstallError::classify(&combined)
    }
}

pub type InstallCallback = Box<dyn FnOnce(InstallStatus) + Send>;

/// Privileged package installation capability.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn create_session(&self, package: &str) -> Result<SessionHandle, InstallError>;

    async fn write(&self, session: SessionHandle, chunk: &[u8]) -> Result<(), InstallError>;

    /// Commit the session. `on_result` fires once, possibly after this returns.
    async fn commit(&self, session: SessionHandle, on_result: InstallCallback)
        -> Result<(), InstallError>;

    async fn abandon(&self, session: SessionHandle);

    /// Command-line install path used when the session API fails.
    async fn install_from_path(&self, path: &Path) -> Result<CommandOutput, InstallError>;

    fn is_installed(&self, package: &str) -> bool;

    fn installed_version(&self, package: &str) -> Option<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_failures() {
        assert_eq!(
            InstallError::classify("Failure [INSTALL_FAILED_USER_RESTRICTED: Install canceled by user]").class(),
            "user-restricted"
        );
        assert_eq!(
            InstallError::classify("INSTALL_FAILED_INSUFFICIENT_STORAGE").class(),
            "insufficient-storage"
        );
        assert_eq!(InstallError::classify("INSTALL_FAILED_OLDER_SDK").class(), "incompatible");
        assert_eq!(InstallError::classify("Error: unknown").class(), "session");
    }

    #[test]
    fn test_command_output_success_marker() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: "Success".to_string(),
            stderr: String::new(),
        };
        assert!(output.succeeded());

        let output = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Failure [INSTALL_FAILED_ALREADY_EXISTS]".to_string(),
        };
        assert!(!output.succeeded());
        assert_eq!(output.failure().class(), "already-exists");
    }

    #[test]
    fn test_pending_status_has_no_outcome() {
        assert!(InstallStatus::PendingUserAction.outcome().is_none());
        assert!(matches!(InstallStatus::Success.outcome(), Some(Ok(()))));
    }
}
