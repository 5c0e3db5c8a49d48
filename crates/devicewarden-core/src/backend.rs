use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyDocument;
use crate::telemetry::TelemetryReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    pub manufacturer: String,
    pub model: String,
    pub os_version: String,
    #[serde(default)]
    pub serial_number: Option<String>,
}

/// Payload of one successful sync call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncResponse {
    pub success: bool,
    /// When false the backend wants every restriction lifted.
    #[serde(alias = "dataControlEnabled")]
    pub enforcement_enabled: bool,
    pub policy: Option<PolicyDocument>,
    pub commands: Vec<Command>,
    pub emergency_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub executed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Lock,
    ApplyPolicy,
    SetupDeliveryApps { packages: Vec<String> },
    InstallApp { app_id: String },
    Unknown(String),
}

impl Command {
    pub fn new(kind: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            timestamp: None,
            payload,
            executed: false,
        }
    }

    pub fn parse(&self) -> CommandKind {
        match self.kind.as_str() {
            "lock" => CommandKind::Lock,
            "apply_policy" => CommandKind::ApplyPolicy,
            "setup_delivery_apps" => CommandKind::SetupDeliveryApps {
                packages: string_list(&self.payload, "packageNames"),
            },
            "install_app" => match self.payload.get("appId").and_then(|id| id.as_str()) {
                Some(app_id) => CommandKind::InstallApp {
                    app_id: app_id.to_string(),
                },
                None => CommandKind::Unknown(self.kind.clone()),
            },
            other => CommandKind::Unknown(other.to_string()),
        }
    }
}

fn string_list(payload: &serde_json::Value, field: &str) -> Vec<String> {
    payload
        .get(field)
        .and_then(|value| value.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            CommandKind::Lock => "lock",
            CommandKind::ApplyPolicy => "apply_policy",
            CommandKind::SetupDeliveryApps { .. } => "setup_delivery_apps",
            CommandKind::InstallApp { .. } => "install_app",
            CommandKind::Unknown(kind) => kind.as_str(),
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyValidation {
    pub valid: bool,
    #[serde(default, alias = "duration")]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDescriptor {
    #[serde(alias = "_id")]
    pub id: String,
    pub package_name: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub version: AppVersion,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub special_config: SpecialConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVersion {
    pub name: String,
    pub code: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpecialConfig {
    pub grant_overlay_permission: bool,
    pub disable_battery_optimization: bool,
    pub protect_in_background: bool,
    pub auto_update: bool,
}

impl AppDescriptor {
    pub fn is_delivery(&self) -> bool {
        self.category.eq_ignore_ascii_case("delivery")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(((self.downloaded.min(total) * 100) / total) as u8),
        }
    }
}

/// The management backend. Request framing and authentication live behind
/// this trait; callers bound every call with their own timeout.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn register_device(&self, device_id: &str, hardware: &HardwareInfo) -> Result<bool>;

    async fn sync_policies(&self, device_id: &str, blocked_apps: &[String]) -> Result<SyncResponse>;

    async fn report_command_executed(
        &self,
        device_id: &str,
        command: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<()>;

    async fn validate_emergency_code(&self, device_id: &str, code: &str)
        -> Result<EmergencyValidation>;

    async fn list_available_apps(&self, device_id: &str) -> Result<Vec<AppDescriptor>>;

    /// Stream the artifact to local storage and return its path.
    async fn download_artifact(
        &self,
        app_id: &str,
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<PathBuf>;

    async fn report_telemetry(&self, device_id: &str, report: &TelemetryReport) -> Result<()>;
}
