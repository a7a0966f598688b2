// Error taxonomy for job and registry operations
//
// None of these are fatal: the daemon reports them back to the requesting
// client as an ActionFailure and keeps running.

use crate::supervisor::protocol::JobState;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("No job with uid '{0}'")]
    UnknownJob(String),

    #[error("Job '{0}' is running and cannot be modified")]
    AlreadyRunning(String),

    #[error("Job '{uid}' cannot be {operation} in state: {state}")]
    InvalidState {
        uid: String,
        operation: &'static str,
        state: JobState,
    },

    #[error("'{0}' is not running, cannot stop it")]
    NotRunning(String),

    #[error("Failed to find process of '{0}', it is no longer running")]
    ProcessGone(String),

    #[error("Exception while signalling process of '{uid}': {message}")]
    Signal { uid: String, message: String },

    #[error("Failed to stop '{uid}', cannot restart: {reason}")]
    RestartStopFailed { uid: String, reason: String },

    #[error("Monitor consumers are already running")]
    AlreadyStarted,
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
