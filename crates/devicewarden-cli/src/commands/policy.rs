use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use devicewarden_core::clock::{Clock, SystemClock};
use devicewarden_core::config::Config;
use devicewarden_core::policy::PolicyDocument;
use devicewarden_core::provider::InMemoryProvider;
use devicewarden_core::restrictions::{ALTERNATIVE_BROWSERS, PRIMARY_BROWSERS};
use devicewarden_core::store::{KeyValueStore, MemoryStore};
use policy_engine::{sanitize, unsafe_reason, ApplyOutcome, EnforcementEngine, PolicyStore};
use safety::{BreakerSettings, EmergencyOverride, SafetyCircuitBreaker};

use super::{classify, StateInputs};

#[derive(Debug)]
pub enum PolicyAction {
    Sanitize { input: PathBuf, json: bool },
    Plan { input: PathBuf },
}

/// What a policy would do to a freshly enrolled device of this profile.
#[derive(Debug)]
pub struct PlanView {
    pub outcome: ApplyOutcome,
    pub restrictions: BTreeSet<String>,
    pub hidden_apps: BTreeSet<String>,
    pub camera_disabled: bool,
    pub location_enabled: bool,
}

fn read_policy(input: &Path) -> Result<PolicyDocument> {
    let contents =
        fs::read_to_string(input).with_context(|| format!("read policy {}", input.display()))?;
    PolicyDocument::from_json(&contents)
}

pub fn plan(config: &Config, policy: &PolicyDocument) -> PlanView {
    let classification = classify(config);
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut installed: BTreeSet<String> = policy.blocked_packages();
    installed.extend(PRIMARY_BROWSERS.iter().map(|package| package.to_string()));
    installed.extend(ALTERNATIVE_BROWSERS.iter().map(|package| package.to_string()));
    installed.extend(policy.delivery_apps.iter().map(|app| app.package_name.clone()));
    let provider = Arc::new(InMemoryProvider::with_installed(installed));

    let breaker = Arc::new(SafetyCircuitBreaker::new(
        store.clone(),
        clock.clone(),
        &classification,
        BreakerSettings::from_config(&config.safety),
    ));
    let emergency = Arc::new(EmergencyOverride::new(
        store.clone(),
        clock,
        config.emergency.default_duration_minutes,
    ));
    let engine = EnforcementEngine::new(
        provider.clone(),
        classification,
        breaker,
        emergency,
        PolicyStore::new(store),
    );

    let outcome = engine.apply_policy(policy);
    PlanView {
        outcome,
        restrictions: provider.active_restrictions(),
        hidden_apps: provider.hidden_apps(),
        camera_disabled: provider.camera_disabled(),
        location_enabled: provider.location_enabled(),
    }
}

pub fn render_plan(view: &PlanView) -> String {
    let mut lines = vec![format!("Outcome: {}", view.outcome)];
    if let ApplyOutcome::Applied(report) = &view.outcome {
        if !report.removed_keys.is_empty() {
            lines.push(format!("Stripped for this device: {}", report.removed_keys.join(", ")));
        }
        lines.push(format!("Browser mode: {}", report.browser_mode));
        for failure in &report.operations.failures {
            lines.push(format!("Skipped {}: {}", failure.item, failure.error));
        }
    }
    lines.push(format!("Restrictions ({}):", view.restrictions.len()));
    lines.extend(view.restrictions.iter().map(|key| format!("  {key}")));
    lines.push(format!("Hidden apps ({}):", view.hidden_apps.len()));
    lines.extend(view.hidden_apps.iter().map(|package| format!("  {package}")));
    lines.push(format!("Camera disabled: {}", view.camera_disabled));
    lines.push(format!("Location forced on: {}", view.location_enabled));
    lines.join("\n")
}

pub fn execute(inputs: &StateInputs, action: PolicyAction) -> Result<()> {
    let config = inputs.load_config()?;
    match action {
        PolicyAction::Sanitize { input, json } => {
            let policy = read_policy(&input)?;
            let classification = classify(&config);
            let sanitized = sanitize(&policy, &classification);
            if json {
                println!("{}", sanitized.policy.to_json_pretty()?);
                return Ok(());
            }
            println!("Device profile: {}", classification.label());
            if sanitized.removed.is_empty() {
                println!("Nothing removed.");
            } else {
                println!("Removed: {}", sanitized.removed.join(", "));
            }
            if let Some(reason) = unsafe_reason(&sanitized.policy, &classification) {
                println!("Still unsafe: {reason}");
            }
        }
        PolicyAction::Plan { input } => {
            let policy = read_policy(&input)?;
            println!("{}", render_plan(&plan(&config, &policy)));
        }
    }
    Ok(())
}
