use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceWardenError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("state store error: {0}")]
    Store(String),
    #[error("agent is not the active device owner")]
    NotDeviceOwner,
    #[error("backend error: {0}")]
    Backend(String),
}
