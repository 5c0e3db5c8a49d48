//! Time-boxed emergency unlock. The window closes on its own once
//! `unlock_until` passes; nothing has to fire at expiry.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use devicewarden_core::backend::Backend;
use devicewarden_core::clock::Clock;
use devicewarden_core::store::{keys, load_json, save_json, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyWindow {
    pub unlock_until: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockSource {
    CachedCode,
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Granted {
        duration_minutes: u32,
        source: UnlockSource,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedCode {
    sha256: String,
    saved_at: OffsetDateTime,
}

pub struct EmergencyOverride {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    default_duration_minutes: u32,
}

impl EmergencyWindow {
    pub fn is_open_at(&self, now: OffsetDateTime) -> bool {
        now <= self.unlock_until
    }

    pub fn remaining(&self, now: OffsetDateTime) -> Duration {
        (self.unlock_until - now).max(Duration::ZERO)
    }
}

impl UnlockOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, UnlockOutcome::Granted { .. })
    }
}

fn digest(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.trim().as_bytes());
    hex::encode(hasher.finalize())
}

impl EmergencyOverride {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        default_duration_minutes: u32,
    ) -> Self {
        Self {
            store,
            clock,
            default_duration_minutes,
        }
    }

    /// Cache a code for offline validation. Blank codes are ignored.
    pub fn save_code(&self, code: &str) -> Result<()> {
        if code.trim().is_empty() {
            return Ok(());
        }
        let cached = CachedCode {
            sha256: digest(code),
            saved_at: self.clock.now(),
        };
        save_json(self.store.as_ref(), keys::EMERGENCY_CODE, &cached)?;
        info!("emergency code cached");
        Ok(())
    }

    /// Compare against the last cached code.
    pub fn validate_code(&self, code: &str) -> Result<bool> {
        if code.trim().is_empty() {
            return Ok(false);
        }
        let cached: Option<CachedCode> = load_json(self.store.as_ref(), keys::EMERGENCY_CODE)?;
        Ok(cached.is_some_and(|cached| cached.sha256 == digest(code)))
    }

    /// Decide whether `code` unlocks the device: cached match first, then the
    /// backend. Never fails; problems come back as a rejection reason.
    pub async fn authorize(
        &self,
        device_id: &str,
        code: &str,
        backend: &dyn Backend,
        timeout: StdDuration,
    ) -> UnlockOutcome {
        let code = code.trim();
        if code.is_empty() {
            return UnlockOutcome::Rejected {
                reason: "emergency code is empty".to_string(),
            };
        }

        match self.validate_code(code) {
            Ok(true) => {
                info!("emergency code matched cached code");
                return UnlockOutcome::Granted {
                    duration_minutes: self.default_duration_minutes,
                    source: UnlockSource::CachedCode,
                };
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "cached emergency code unreadable"),
        }

        let validation =
            match tokio::time::timeout(timeout, backend.validate_emergency_code(device_id, code)).await {
                Ok(Ok(validation)) => validation,
                Ok(Err(err)) => {
                    warn!(error = %err, "emergency code validation failed");
                    return UnlockOutcome::Rejected {
                        reason: format!("could not validate code with server: {err}"),
                    };
                }
                Err(_) => {
                    warn!("emergency code validation timed out");
                    return UnlockOutcome::Rejected {
                        reason: "could not validate code with server: timed out".to_string(),
                    };
                }
            };

        if !validation.valid {
            return UnlockOutcome::Rejected {
                reason: validation
                    .message
                    .unwrap_or_else(|| "invalid emergency code".to_string()),
            };
        }

        if let Err(err) = self.save_code(code) {
            warn!(error = %err, "could not cache validated emergency code");
        }
        UnlockOutcome::Granted {
            duration_minutes: validation
                .duration_minutes
                .filter(|minutes| *minutes > 0)
                .unwrap_or(self.default_duration_minutes),
            source: UnlockSource::Backend,
        }
    }

    pub fn activate(&self, duration_minutes: u32) -> Result<EmergencyWindow> {
        let window = EmergencyWindow {
            unlock_until: self.clock.now() + Duration::minutes(i64::from(duration_minutes)),
        };
        save_json(self.store.as_ref(), keys::EMERGENCY_UNLOCK_UNTIL, &window)?;
        info!(duration_minutes, "emergency window opened");
        Ok(window)
    }

    /// The open window, if any. Expired windows read as `None`.
    pub fn window(&self) -> Result<Option<EmergencyWindow>> {
        let window: Option<EmergencyWindow> =
            load_json(self.store.as_ref(), keys::EMERGENCY_UNLOCK_UNTIL)?;
        let now = self.clock.now();
        Ok(window.filter(|window| window.is_open_at(now)))
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.window()?.is_some())
    }

    /// Close the window early.
    pub fn deactivate(&self) -> Result<()> {
        self.store.remove(keys::EMERGENCY_UNLOCK_UNTIL)?;
        info!("emergency window closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use devicewarden_core::backend::{
        AppDescriptor, DownloadProgress, EmergencyValidation, HardwareInfo, SyncResponse,
    };
    use devicewarden_core::clock::ManualClock;
    use devicewarden_core::store::MemoryStore;
    use devicewarden_core::telemetry::TelemetryReport;

    struct ValidatingBackend {
        answer: Option<EmergencyValidation>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Backend for ValidatingBackend {
        async fn register_device(&self, _: &str, _: &HardwareInfo) -> Result<bool> {
            Ok(true)
        }

        async fn sync_policies(&self, _: &str, _: &[String]) -> Result<SyncResponse> {
            anyhow::bail!("not used")
        }

        async fn report_command_executed(&self, _: &str, _: &str, _: bool, _: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn validate_emergency_code(&self, _: &str, _: &str) -> Result<EmergencyValidation> {
            *self.calls.lock().unwrap() += 1;
            self.answer
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }

        async fn list_available_apps(&self, _: &str) -> Result<Vec<AppDescriptor>> {
            Ok(Vec::new())
        }

        async fn download_artifact(
            &self,
            _: &str,
            _: &(dyn Fn(DownloadProgress) + Send + Sync),
        ) -> Result<PathBuf> {
            anyhow::bail!("not used")
        }

        async fn report_telemetry(&self, _: &str, _: &TelemetryReport) -> Result<()> {
            Ok(())
        }
    }

    fn create_override() -> (EmergencyOverride, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let emergency = EmergencyOverride::new(Arc::new(MemoryStore::new()), clock.clone(), 30);
        (emergency, clock)
    }

    fn validating_backend(answer: Option<EmergencyValidation>) -> ValidatingBackend {
        ValidatingBackend {
            answer,
            calls: Mutex::new(0),
        }
    }

    const TIMEOUT: StdDuration = StdDuration::from_secs(15);

    #[test]
    fn test_window_expires_without_explicit_close() {
        let (emergency, clock) = create_override();
        emergency.activate(30).unwrap();
        assert!(emergency.is_active().unwrap());
        clock.advance(Duration::minutes(29));
        assert!(emergency.is_active().unwrap());
        clock.advance(Duration::minutes(2));
        assert!(!emergency.is_active().unwrap());
    }

    #[test]
    fn test_deactivate_closes_early() {
        let (emergency, _) = create_override();
        emergency.activate(30).unwrap();
        emergency.deactivate().unwrap();
        assert!(emergency.window().unwrap().is_none());
    }

    #[test]
    fn test_validate_against_cached_code() {
        let (emergency, _) = create_override();
        assert!(!emergency.validate_code("4821").unwrap());
        emergency.save_code("4821").unwrap();
        assert!(emergency.validate_code(" 4821 ").unwrap());
        assert!(!emergency.validate_code("1111").unwrap());
        assert!(!emergency.validate_code("").unwrap());
    }

    #[tokio::test]
    async fn test_cached_code_needs_no_network() {
        let (emergency, _) = create_override();
        emergency.save_code("4821").unwrap();
        let backend = validating_backend(None);
        let outcome = emergency.authorize("dev-1", "4821", &backend, TIMEOUT).await;
        assert_eq!(
            outcome,
            UnlockOutcome::Granted {
                duration_minutes: 30,
                source: UnlockSource::CachedCode
            }
        );
        assert_eq!(*backend.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backend_code_is_cached_with_server_duration() {
        let (emergency, _) = create_override();
        let backend = validating_backend(Some(EmergencyValidation {
            valid: true,
            duration_minutes: Some(45),
            message: None,
        }));
        let outcome = emergency.authorize("dev-1", "9090", &backend, TIMEOUT).await;
        assert_eq!(
            outcome,
            UnlockOutcome::Granted {
                duration_minutes: 45,
                source: UnlockSource::Backend
            }
        );
        assert!(emergency.validate_code("9090").unwrap());
    }

    #[tokio::test]
    async fn test_invalid_code_is_rejected_with_reason() {
        let (emergency, _) = create_override();
        let backend = validating_backend(Some(EmergencyValidation {
            valid: false,
            duration_minutes: None,
            message: Some("code expired".to_string()),
        }));
        let outcome = emergency.authorize("dev-1", "0000", &backend, TIMEOUT).await;
        assert_eq!(
            outcome,
            UnlockOutcome::Rejected {
                reason: "code expired".to_string()
            }
        );

        let offline = validating_backend(None);
        let outcome = emergency.authorize("dev-1", "0000", &offline, TIMEOUT).await;
        assert!(matches!(outcome, UnlockOutcome::Rejected { reason } if reason.contains("connection refused")));
    }
}
