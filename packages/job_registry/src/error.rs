use std::fmt;
use std::io;

use crate::job::JobId;

/// Errors that can occur during registry operations
#[derive(Debug)]
pub enum RegistryError {
    /// A job with this id is already registered
    DuplicateId(JobId),
    /// No job with this id is registered
    NotFound(JobId),
    /// The configured concurrent job limit is reached
    LimitReached(usize),
    /// The launcher was given no program to run
    EmptyCommand,
    /// The process could not be started
    SpawnFailed(io::Error),
    /// The termination signal could not be delivered
    SignalFailed { id: JobId, message: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateId(id) => write!(f, "job {} is already registered", id),
            RegistryError::NotFound(id) => write!(f, "job {} not found", id),
            RegistryError::LimitReached(running) => {
                write!(f, "job limit reached ({} running)", running)
            }
            RegistryError::EmptyCommand => write!(f, "no program configured"),
            RegistryError::SpawnFailed(e) => write!(f, "failed to start: {}", e),
            RegistryError::SignalFailed { id, message } => {
                write!(f, "failed to stop {}: {}", id, message)
            }
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::SpawnFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegistryError {
    fn from(err: io::Error) -> Self {
        RegistryError::SpawnFailed(err)
    }
}
