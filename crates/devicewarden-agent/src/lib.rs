//! On-device agent: boot handling, backend sync and command dispatch.

mod agent;
pub mod backoff;
mod dispatch;
pub mod scheduler;
#[cfg(test)]
mod test_support;

pub use agent::{Agent, AgentParts, AgentStatus, BootHalt, BootReport};
pub use dispatch::{CommandResult, SyncCycleResult};
pub use scheduler::{ExpiryWatch, SchedulerSettings, SyncScheduler};
