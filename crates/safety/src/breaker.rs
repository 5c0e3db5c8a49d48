//! Boot-loop detection and the safe-mode latch.
//!
//! Once tripped, safe mode stays on across restarts until an operator resets
//! it. Profiles with automatic filtering are never latched; trips on those
//! devices are logged and dropped.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

use devicewarden_core::clock::Clock;
use devicewarden_core::config::SafetyConfig;
use devicewarden_core::profile::ProfileClassification;
use devicewarden_core::store::{keys, load_json, save_json, KeyValueStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeModeState {
    pub active: bool,
    pub reason: String,
    pub activated_at: Option<OffsetDateTime>,
    pub activation_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootCounter {
    pub count: u32,
    /// First boot of the current streak.
    pub window_start: OffsetDateTime,
    #[serde(default)]
    pub last_boot: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TripReason {
    BootLoop { boots: u32, window_minutes: i64 },
    LowBattery { percent: u8 },
    PolicyFailure(String),
    UnsafePolicy(String),
    BootFailure(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TripOutcome {
    Tripped(SafeModeState),
    /// The profile is exempt; nothing was recorded.
    Exempt,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub boot_threshold: u32,
    pub boot_window: Duration,
    pub battery_floor_percent: u8,
    pub excessive_activation_count: u32,
}

pub struct SafetyCircuitBreaker {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: BreakerSettings,
    exempt: bool,
    profile_label: String,
    guard: Mutex<()>,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::BootLoop {
                boots,
                window_minutes,
            } => write!(f, "boot loop detected: {boots} restarts in {window_minutes} minutes"),
            TripReason::LowBattery { percent } => write!(f, "battery critically low at boot ({percent}%)"),
            TripReason::PolicyFailure(detail) => write!(f, "error applying policy: {detail}"),
            TripReason::UnsafePolicy(detail) => write!(f, "unsafe policy rejected: {detail}"),
            TripReason::BootFailure(detail) => write!(f, "error during boot: {detail}"),
        }
    }
}

impl BootCounter {
    pub fn previous_boot(&self) -> OffsetDateTime {
        self.last_boot.unwrap_or(self.window_start)
    }
}

impl TripOutcome {
    pub fn tripped(&self) -> bool {
        matches!(self, TripOutcome::Tripped(_))
    }
}

impl BreakerSettings {
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self {
            boot_threshold: config.boot_threshold,
            boot_window: Duration::seconds(config.boot_window_secs as i64),
            battery_floor_percent: config.battery_floor_percent,
            excessive_activation_count: config.excessive_activation_count,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            boot_threshold: 3,
            boot_window: Duration::minutes(10),
            battery_floor_percent: 20,
            excessive_activation_count: 5,
        }
    }
}

impl SafetyCircuitBreaker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        classification: &ProfileClassification,
        settings: BreakerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            exempt: classification.is_exempt(),
            profile_label: classification.label().to_string(),
            guard: Mutex::new(()),
        }
    }

    pub fn is_exempt(&self) -> bool {
        self.exempt
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Record one process start. A boot less than one window after the
    /// previous one extends the streak; the streak trips at the threshold and
    /// the counter is cleared when it does.
    pub fn register_boot(&self) -> Result<Option<TripOutcome>> {
        let boots = {
            let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let now = self.clock.now();
            let counter = match load_json::<BootCounter>(self.store.as_ref(), keys::BOOT_COUNTER)? {
                Some(counter) if now - counter.previous_boot() < self.settings.boot_window => BootCounter {
                    count: counter.count.saturating_add(1),
                    window_start: counter.window_start,
                    last_boot: Some(now),
                },
                _ => BootCounter {
                    count: 1,
                    window_start: now,
                    last_boot: Some(now),
                },
            };
            info!(boots = counter.count, "boot registered");
            if counter.count >= self.settings.boot_threshold {
                self.store.remove(keys::BOOT_COUNTER)?;
                Some(counter.count)
            } else {
                save_json(self.store.as_ref(), keys::BOOT_COUNTER, &counter)?;
                None
            }
        };

        match boots {
            Some(boots) => {
                let reason = TripReason::BootLoop {
                    boots,
                    window_minutes: self.settings.boot_window.whole_minutes(),
                };
                Ok(Some(self.trip(reason)?))
            }
            None => Ok(None),
        }
    }

    /// Trip when the battery is known to be below the floor. Unknown levels pass.
    pub fn check_battery(&self, percent: Option<u8>) -> Result<Option<TripOutcome>> {
        match percent {
            Some(percent) if percent < self.settings.battery_floor_percent => {
                Ok(Some(self.trip(TripReason::LowBattery { percent })?))
            }
            _ => Ok(None),
        }
    }

    pub fn trip(&self, reason: TripReason) -> Result<TripOutcome> {
        if self.exempt {
            warn!(
                profile = %self.profile_label,
                %reason,
                "safe mode trip ignored for profile with automatic filtering"
            );
            return Ok(TripOutcome::Exempt);
        }

        let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = self.load_state()?;
        let state = SafeModeState {
            active: true,
            reason: reason.to_string(),
            activated_at: Some(self.clock.now()),
            activation_count: previous.activation_count.saturating_add(1),
        };
        save_json(self.store.as_ref(), keys::SAFE_MODE, &state)?;
        error!(
            %reason,
            activations = state.activation_count,
            "safe mode activated; enforcement suspended"
        );
        Ok(TripOutcome::Tripped(state))
    }

    /// Always false for exempt profiles.
    pub fn is_active(&self) -> Result<bool> {
        if self.exempt {
            return Ok(false);
        }
        Ok(self.load_state()?.active)
    }

    pub fn state(&self) -> Result<SafeModeState> {
        self.load_state()
    }

    pub fn boot_counter(&self) -> Result<Option<BootCounter>> {
        load_json(self.store.as_ref(), keys::BOOT_COUNTER)
    }

    /// Operator reset: leaves safe mode and forgets recent boots. The
    /// activation count is history and is kept.
    pub fn reset(&self) -> Result<SafeModeState> {
        let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = self.load_state()?;
        let state = SafeModeState {
            active: false,
            reason: String::new(),
            activated_at: None,
            activation_count: previous.activation_count,
        };
        save_json(self.store.as_ref(), keys::SAFE_MODE, &state)?;
        self.store.remove(keys::BOOT_COUNTER)?;
        info!(was_active = previous.active, "safe mode reset");
        Ok(state)
    }

    pub fn excessive_activations(&self) -> Result<bool> {
        Ok(self.load_state()?.activation_count >= self.settings.excessive_activation_count)
    }

    fn load_state(&self) -> Result<SafeModeState> {
        Ok(load_json(self.store.as_ref(), keys::SAFE_MODE)?.unwrap_or_default())
    }
}
