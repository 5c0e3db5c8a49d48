use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::breaker::{BootCounter, SafeModeState, SafetyCircuitBreaker};
use crate::emergency::{EmergencyOverride, EmergencyWindow};

/// Point-in-time view of everything that can switch enforcement off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyReport {
    pub profile: String,
    pub automatic_filtering: bool,
    pub safe_mode: SafeModeState,
    pub excessive_activations: bool,
    pub boot_counter: Option<BootCounter>,
    pub emergency: Option<EmergencyWindow>,
    pub generated_at: OffsetDateTime,
}

impl SafetyReport {
    pub fn collect(
        profile: &str,
        breaker: &SafetyCircuitBreaker,
        emergency: &EmergencyOverride,
        now: OffsetDateTime,
    ) -> Result<Self> {
        Ok(Self {
            profile: profile.to_string(),
            automatic_filtering: breaker.is_exempt(),
            safe_mode: breaker.state()?,
            excessive_activations: breaker.excessive_activations()?,
            boot_counter: breaker.boot_counter()?,
            emergency: emergency.window()?,
            generated_at: now,
        })
    }

    pub fn human_summary(&self) -> String {
        let mut lines = vec![format!("Device profile: {}", self.profile)];
        if self.automatic_filtering {
            lines.push("Automatic filtering is on; dangerous settings are stripped and safe mode is never entered.".to_string());
        }

        if self.safe_mode.active {
            let since = self
                .safe_mode
                .activated_at
                .map(|at| format!(" since {at}"))
                .unwrap_or_default();
            lines.push(format!("Safe mode is ACTIVE{since}: {}", self.safe_mode.reason));
            lines.push("No policy will be applied until an operator resets safe mode.".to_string());
        } else {
            lines.push("Safe mode is off.".to_string());
        }
        lines.push(format!("Safe mode activations: {}", self.safe_mode.activation_count));
        if self.excessive_activations {
            lines.push("Warning: safe mode has been entered repeatedly; inspect the assigned policy.".to_string());
        }

        if let Some(counter) = &self.boot_counter {
            lines.push(format!("Recent boots: {} since {}", counter.count, counter.window_start));
        }

        match &self.emergency {
            Some(window) => {
                let remaining = window.remaining(self.generated_at).whole_minutes();
                lines.push(format!("Emergency unlock active for another {remaining} min."));
            }
            None => lines.push("No emergency unlock in progress.".to_string()),
        }

        lines.join("\n")
    }
}
