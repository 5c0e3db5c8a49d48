use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f32,
}

/// Device sensors read by the boot sequence and the auxiliary reporting loop.
pub trait TelemetrySource: Send + Sync {
    /// Battery charge in percent, `None` when unknown.
    fn battery_percent(&self) -> Option<u8>;
    fn last_location(&self) -> Option<Location>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub battery_percent: Option<u8>,
    pub location: Option<Location>,
    pub safe_mode: bool,
    pub emergency_active: bool,
    pub policy_name: Option<String>,
    pub reported_at: OffsetDateTime,
}

/// Fixed readings, for hosts without sensors and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTelemetry {
    pub battery_percent: Option<u8>,
    pub location: Option<Location>,
}

impl TelemetrySource for StaticTelemetry {
    fn battery_percent(&self) -> Option<u8> {
        self.battery_percent
    }

    fn last_location(&self) -> Option<Location> {
        self.location
    }
}
