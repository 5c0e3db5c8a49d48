use anyhow::{Context, Result};
use serde::Serialize;

use policy_engine::PolicyStore;
use safety::SafetyReport;

use super::{LocalState, StateInputs};

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub device_id: String,
    pub safety: SafetyReport,
    pub policy_name: Option<String>,
    pub blocked_apps: Vec<String>,
}

pub fn collect(state: &LocalState) -> Result<StatusView> {
    let safety = SafetyReport::collect(
        state.classification.label(),
        &state.breaker,
        &state.emergency,
        state.clock.now(),
    )?;
    let policy = PolicyStore::new(state.store.clone()).load()?;
    Ok(StatusView {
        device_id: state.config.device.device_id.clone(),
        safety,
        policy_name: policy.as_ref().map(|policy| policy.name.clone()),
        blocked_apps: policy
            .map(|policy| policy.blocked_packages().into_iter().collect())
            .unwrap_or_default(),
    })
}

pub fn render(view: &StatusView) -> String {
    let mut output = format!("Device: {}\n{}", view.device_id, view.safety.human_summary());
    match &view.policy_name {
        Some(name) => {
            output.push_str(&format!("\nCurrent policy: {name}"));
            output.push_str(&format!("\nBlocked apps: {}", view.blocked_apps.len()));
        }
        None => output.push_str("\nNo policy stored."),
    }
    output
}

pub fn execute(inputs: &StateInputs, json: bool) -> Result<()> {
    let state = inputs.open()?;
    let view = collect(&state)?;
    if json {
        let output = serde_json::to_string_pretty(&view).context("render status JSON")?;
        println!("{}", output);
    } else {
        println!("{}", render(&view));
    }
    Ok(())
}
