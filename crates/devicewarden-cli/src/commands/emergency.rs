use anyhow::Result;

use super::StateInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyAction {
    Status,
    Deactivate,
}

pub fn execute(inputs: &StateInputs, action: EmergencyAction) -> Result<()> {
    let state = inputs.open()?;
    match action {
        EmergencyAction::Status => match state.emergency.window()? {
            Some(window) => {
                let remaining = window.remaining(state.clock.now());
                println!(
                    "Emergency unlock active until {} ({} minutes left)",
                    window.unlock_until,
                    remaining.whole_minutes()
                );
            }
            None => println!("No emergency unlock active."),
        },
        EmergencyAction::Deactivate => {
            state.emergency.deactivate()?;
            println!("Emergency unlock ended; restrictions return on the next sync.");
        }
    }
    Ok(())
}
