//! One sync cycle: fetch, dispatch commands, report, then enforce.

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use devicewarden_core::backend::{Command, CommandKind};
use devicewarden_core::policy::PolicyDocument;
use policy_engine::ApplyOutcome;

use crate::agent::Agent;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    pub skipped_for_emergency: bool,
    pub enforcement_enabled: bool,
    pub commands: Vec<CommandResult>,
    /// Outcome of the last policy application in this cycle, if any.
    pub policy: Option<ApplyOutcome>,
    pub cleared: bool,
    pub emergency_code_cached: bool,
}

impl CommandResult {
    fn ok(command: &CommandKind) -> Self {
        Self {
            command: command.to_string(),
            success: true,
            error: None,
        }
    }

    fn failed(command: &CommandKind, error: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            success: false,
            error: Some(error.into()),
        }
    }
}

impl Agent {
    /// Run one sync against the backend.
    ///
    /// Skipped entirely while an emergency window is open. A transport error
    /// or a response without `success` is returned as `Err` so the scheduler
    /// can back off.
    pub async fn sync_once(&self) -> Result<SyncCycleResult> {
        if self.emergency.is_active()? {
            info!("emergency window open; sync skipped");
            return Ok(SyncCycleResult {
                skipped_for_emergency: true,
                ..SyncCycleResult::default()
            });
        }

        let blocked_apps = self.engine.current_blocked_apps()?;
        let response = tokio::time::timeout(
            self.config.backend.read_timeout(),
            self.backend.sync_policies(self.device_id(), &blocked_apps),
        )
        .await
        .map_err(|_| anyhow!("policy sync timed out"))?
        .context("sync policies")?;
        if !response.success {
            bail!("backend reported an unsuccessful sync");
        }

        let mut result = SyncCycleResult {
            enforcement_enabled: response.enforcement_enabled,
            ..SyncCycleResult::default()
        };

        if let Some(code) = response.emergency_code.as_deref().filter(|code| !code.trim().is_empty()) {
            self.emergency.save_code(code)?;
            result.emergency_code_cached = true;
        }

        if !response.enforcement_enabled {
            info!("backend disabled enforcement; clearing all policies");
            let report = self.engine.clear_all_policies()?;
            if !report.is_clean() {
                warn!(failures = report.failures.len(), "some restrictions could not be cleared");
            }
            result.cleared = true;
            return Ok(result);
        }

        let safe_mode = self.breaker.is_active()?;
        let policy = response.policy.as_ref();
        let mut applied_by_command = false;
        for command in &response.commands {
            let kind = command.parse();
            if kind == CommandKind::ApplyPolicy && policy.is_some() {
                applied_by_command = true;
            }
            let (command_result, outcome) = self.execute(command, &kind, policy, safe_mode).await;
            if outcome.is_some() {
                result.policy = outcome;
            }
            self.report_command(&command_result).await;
            result.commands.push(command_result);
        }

        if let Some(policy) = policy {
            if applied_by_command {
                debug!(policy = %policy.name, "policy already applied by command");
            } else {
                let outcome = self.engine.apply_policy(policy);
                info!(%outcome, "sync policy applied");
                result.policy = Some(outcome);
            }
        }
        Ok(result)
    }

    async fn execute(
        &self,
        command: &Command,
        kind: &CommandKind,
        policy: Option<&PolicyDocument>,
        safe_mode: bool,
    ) -> (CommandResult, Option<ApplyOutcome>) {
        debug!(command = %command.kind, "executing backend command");
        match kind {
            CommandKind::Lock => match self.engine.lock_device() {
                Ok(()) => (CommandResult::ok(kind), None),
                Err(err) => (CommandResult::failed(kind, format!("{err:#}")), None),
            },
            CommandKind::ApplyPolicy => match policy {
                Some(policy) => {
                    let outcome = self.engine.apply_policy(policy);
                    let result = match outcome.failure_reason() {
                        None => CommandResult::ok(kind),
                        Some(reason) => CommandResult::failed(kind, reason),
                    };
                    (result, Some(outcome))
                }
                None => (CommandResult::failed(kind, "no policy in sync response"), None),
            },
            CommandKind::SetupDeliveryApps { .. } if safe_mode => {
                (CommandResult::failed(kind, "safe mode active"), None)
            }
            CommandKind::SetupDeliveryApps { packages } => {
                match self.engine.setup_delivery_apps(packages) {
                    Ok(results) => {
                        let failed: Vec<&str> = results
                            .iter()
                            .filter(|(_, ok)| !**ok)
                            .map(|(package, _)| package.as_str())
                            .collect();
                        if failed.is_empty() {
                            (CommandResult::ok(kind), None)
                        } else {
                            let message = format!("some apps failed: {}", failed.join(", "));
                            (CommandResult::failed(kind, message), None)
                        }
                    }
                    Err(err) => (CommandResult::failed(kind, format!("{err:#}")), None),
                }
            }
            CommandKind::InstallApp { app_id } => match self.install_app(app_id).await {
                Ok(report) if report.succeeded() => (CommandResult::ok(kind), None),
                Ok(report) => {
                    let error = report.error.unwrap_or_else(|| "installation failed".to_string());
                    (CommandResult::failed(kind, error), None)
                }
                Err(err) => (CommandResult::failed(kind, format!("{err:#}")), None),
            },
            CommandKind::Unknown(_) => (CommandResult::failed(kind, "unsupported command"), None),
        }
    }

    async fn report_command(&self, result: &CommandResult) {
        let call = self.backend.report_command_executed(
            self.device_id(),
            &result.command,
            result.success,
            result.error.as_deref(),
        );
        match tokio::time::timeout(self.config.backend.read_timeout(), call).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(command = %result.command, error = %err, "command report failed"),
            Err(_) => warn!(command = %result.command, "command report timed out"),
        }
    }
}
