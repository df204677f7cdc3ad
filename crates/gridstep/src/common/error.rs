use thiserror::Error;

use crate::common::error::GridError::GenericError;

#[derive(Debug, Error)]
pub enum GridError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// A declined confirmation. Deliberate no-op exit, not a failure.
    #[error("Aborted")]
    UserAbort,
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Scheduler CLI output did not match the expected contract.
    #[error("Scheduler protocol error: {0}")]
    SchedulerProtocol(String),
    /// The scheduler CLI itself failed.
    #[error("External tool failure: {0}")]
    ToolFailure(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<anyhow::Error> for GridError {
    fn from(error: anyhow::Error) -> Self {
        GenericError(error.to_string())
    }
}

impl From<String> for GridError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn config_error<T>(message: String) -> crate::Result<T> {
    Err(GridError::ConfigError(message))
}

pub fn protocol_error<T>(message: String) -> crate::Result<T> {
    Err(GridError::SchedulerProtocol(message))
}
