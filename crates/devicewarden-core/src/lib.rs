pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod package;
pub mod policy;
pub mod profile;
pub mod provider;
pub mod restrictions;
pub mod store;
pub mod telemetry;

pub use backend::{Backend, Command, CommandKind, EmergencyValidation, SyncResponse};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigPaths};
pub use error::DeviceWardenError;
pub use ids::JobId;
pub use package::{InstallError, InstallStatus, PackageInstaller};
pub use policy::{BrowserMode, PolicyDocument};
pub use profile::{DeviceProfile, DeviceProfileClassifier, ProfileClassification};
pub use provider::{InMemoryProvider, ProviderError, RestrictionProvider, SpecialAccess};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use telemetry::TelemetrySource;
