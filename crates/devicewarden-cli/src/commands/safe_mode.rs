use anyhow::Result;

use super::StateInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeModeAction {
    Status,
    Reset,
}

pub fn execute(inputs: &StateInputs, action: SafeModeAction) -> Result<()> {
    let state = inputs.open()?;
    match action {
        SafeModeAction::Status => {
            let safe_mode = state.breaker.state()?;
            if safe_mode.active {
                println!("Safe mode: ACTIVE ({})", safe_mode.reason);
            } else {
                println!("Safe mode: off");
            }
            println!("Activations: {}", safe_mode.activation_count);
        }
        SafeModeAction::Reset => {
            let safe_mode = state.breaker.reset()?;
            println!(
                "Safe mode cleared (activations so far: {})",
                safe_mode.activation_count
            );
        }
    }
    Ok(())
}
