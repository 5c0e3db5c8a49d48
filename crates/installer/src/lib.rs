//! Installation pipeline: relax, download, install, verify, restore.

mod job;
mod orchestrator;
pub mod updates;

#[cfg(test)]
mod test_support;

pub use job::{InstallReport, InstallationJob, JobState, Verification};
pub use orchestrator::{InstallOrchestrator, InstallSettings};
pub use updates::AutoUpdater;
