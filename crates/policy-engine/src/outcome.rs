use std::fmt;

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use devicewarden_core::provider::ProviderResult;
use safety::TripOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub error: String,
}

/// Per-item tally of a best-effort sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub applied: usize,
    pub failures: Vec<ItemFailure>,
}

impl OperationReport {
    /// Count one provider call. Item failures are logged and kept; only a
    /// fatal provider error comes back as `Err`.
    pub(crate) fn record(&mut self, item: &str, result: ProviderResult<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.applied = self.applied.saturating_add(1);
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(anyhow::Error::new(err).context(format!("apply {item}"))),
            Err(err) => {
                warn!(item, error = %err, "restriction step skipped");
                self.failures.push(ItemFailure {
                    item: item.to_string(),
                    error: err.to_string(),
                });
                Ok(())
            }
        }
    }

    pub fn merge(&mut self, other: OperationReport) {
        self.applied = self.applied.saturating_add(other.applied);
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyReport {
    pub policy_name: String,
    pub removed_keys: Vec<String>,
    pub blocked_apps: usize,
    pub browser_mode: String,
    pub operations: OperationReport,
}

impl ApplyReport {
    pub fn is_partial(&self) -> bool {
        !self.operations.is_clean()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(ApplyReport),
    /// An emergency window is open; nothing was touched.
    SuspendedByEmergency,
    /// Safe mode is latched; nothing was touched.
    SuppressedBySafeMode,
    RejectedUnsafe { reason: String, trip: TripOutcome },
    NotDeviceOwner,
    Failed { reason: String },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_) | ApplyOutcome::SuspendedByEmergency)
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ApplyOutcome::Applied(_) | ApplyOutcome::SuspendedByEmergency => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Applied(report) if report.is_partial() => write!(
                f,
                "policy '{}' applied with {} skipped steps",
                report.policy_name,
                report.operations.failures.len()
            ),
            ApplyOutcome::Applied(report) => write!(f, "policy '{}' applied", report.policy_name),
            ApplyOutcome::SuspendedByEmergency => write!(f, "enforcement suspended by emergency unlock"),
            ApplyOutcome::SuppressedBySafeMode => write!(f, "enforcement suppressed by safe mode"),
            ApplyOutcome::RejectedUnsafe { reason, .. } => write!(f, "policy rejected: {reason}"),
            ApplyOutcome::NotDeviceOwner => write!(f, "agent is not the active device owner"),
            ApplyOutcome::Failed { reason } => write!(f, "policy application failed: {reason}"),
        }
    }
}
