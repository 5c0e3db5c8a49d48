use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use devicewarden_core::config::Config;

use crate::agent::Agent;
use crate::backoff::Backoff;
use crate::dispatch::SyncCycleResult;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub emergency_poll: Duration,
    pub auxiliary_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub auto_update: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        let sync = &config.sync;
        Self {
            initial_delay: Duration::from_secs(sync.initial_delay_secs),
            interval: Duration::from_secs(sync.interval_secs),
            emergency_poll: Duration::from_secs(sync.emergency_poll_secs),
            auxiliary_interval: Duration::from_secs(sync.auxiliary_interval_secs),
            backoff_base: Duration::from_secs(sync.backoff_base_secs),
            backoff_cap: Duration::from_secs(sync.backoff_cap_secs),
            auto_update: config.install.auto_update,
        }
    }
}

/// Edge detector for the emergency window: reports the moment it closes.
#[derive(Debug, Default)]
pub struct ExpiryWatch {
    was_active: bool,
}

impl ExpiryWatch {
    /// `true` exactly once per active-to-inactive transition.
    pub fn observe(&mut self, active: bool) -> bool {
        let expired = self.was_active && !active;
        self.was_active = active;
        expired
    }
}

/// Drives periodic sync with backoff, the emergency expiry watch and the
/// auxiliary telemetry/update loop until shutdown is signalled.
pub struct SyncScheduler {
    agent: Arc<Agent>,
    settings: SchedulerSettings,
    backoff: Mutex<Backoff>,
    wake: Notify,
}

impl SyncScheduler {
    pub fn new(agent: Arc<Agent>, settings: SchedulerSettings) -> Self {
        Self {
            agent,
            backoff: Mutex::new(Backoff::new(settings.backoff_base, settings.backoff_cap)),
            settings,
            wake: Notify::new(),
        }
    }

    pub fn failures(&self) -> u32 {
        self.backoff().failures()
    }

    /// Ask the sync loop to run now instead of waiting out its delay.
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            emergency_poll_secs = self.settings.emergency_poll.as_secs(),
            "scheduler started"
        );
        tokio::join!(
            self.sync_loop(shutdown.clone()),
            self.emergency_loop(shutdown.clone()),
            self.auxiliary_loop(shutdown),
        );
        info!("scheduler stopped");
    }

    /// One sync; returns the wait before the next one.
    pub async fn sync_cycle(&self) -> Duration {
        match self.agent.sync_once().await {
            Ok(result) => {
                self.backoff().reset();
                log_cycle(&result);
                self.settings.interval
            }
            Err(err) => {
                let delay = self.backoff().record_failure();
                let message = format!("{err:#}");
                warn!(
                    error = %message,
                    failures = self.failures(),
                    retry_secs = delay.as_secs(),
                    "sync failed"
                );
                delay
            }
        }
    }

    async fn sync_loop(&self, mut shutdown: watch::Receiver<bool>) {
        if wait(&mut shutdown, self.settings.initial_delay).await {
            return;
        }
        // The first sync covers any request made during the initial delay.
        self.drain_requests().await;
        loop {
            let delay = self.sync_cycle().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => debug!("sync requested early"),
            }
        }
    }

    async fn emergency_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut watch = ExpiryWatch::default();
        loop {
            match self.agent.emergency().is_active() {
                Ok(active) => {
                    if watch.observe(active) {
                        info!("emergency window expired; resyncing");
                        self.request_sync();
                    }
                }
                Err(err) => warn!(error = %err, "emergency state unreadable"),
            }
            if wait(&mut shutdown, self.settings.emergency_poll).await {
                break;
            }
        }
    }

    async fn auxiliary_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if wait(&mut shutdown, self.settings.auxiliary_interval).await {
                break;
            }
            if let Err(err) = self.agent.report_telemetry().await {
                warn!(error = %err, "telemetry report failed");
            }
            if self.settings.auto_update {
                match self.agent.check_updates().await {
                    Ok(reports) if !reports.is_empty() => {
                        let failed = reports.iter().filter(|report| !report.succeeded()).count();
                        info!(updates = reports.len(), failed, "auto-update pass finished");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "auto-update check failed"),
                }
            }
        }
    }

    async fn drain_requests(&self) {
        tokio::select! {
            biased;
            _ = self.wake.notified() => debug!("pending sync request folded into first sync"),
            _ = std::future::ready(()) => {}
        }
    }

    fn backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sleep for `delay`; `true` when shutdown fired first.
async fn wait(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

fn log_cycle(result: &SyncCycleResult) {
    if result.skipped_for_emergency {
        return;
    }
    let failed = result.commands.iter().filter(|command| !command.success).count();
    match &result.policy {
        Some(outcome) => info!(
            commands = result.commands.len(),
            failed,
            cleared = result.cleared,
            %outcome,
            "sync finished"
        ),
        None => info!(
            commands = result.commands.len(),
            failed,
            cleared = result.cleared,
            "sync finished"
        ),
    }
}
