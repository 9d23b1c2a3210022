//! Dialer errors returned to callers of the session API

use thiserror::Error;

use super::value_objects::CallAttemptId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialerError {
    #[error("Not registered to SIP server")]
    NotRegistered,

    #[error("Registration already in progress")]
    RegistrationInProgress,

    #[error("Invalid number: {0:?}")]
    InvalidNumber(String),

    #[error("Unknown call: {0}")]
    UnknownCall(CallAttemptId),

    #[error("Auto-dialer is already running")]
    AlreadyRunning,

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Transport error: {0}")]
    Transport(String),
}
