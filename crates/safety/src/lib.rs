//! Safe mode and emergency override: the two ways enforcement gets switched off.

pub mod breaker;
pub mod emergency;
pub mod report;

pub use breaker::{BootCounter, BreakerSettings, SafeModeState, SafetyCircuitBreaker, TripOutcome, TripReason};
pub use emergency::{EmergencyOverride, EmergencyWindow, UnlockOutcome, UnlockSource};
pub use report::SafetyReport;
