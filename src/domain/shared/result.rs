//! Dialer result type

use super::error::DialerError;

/// Standard result type for session operations
pub type Result<T> = std::result::Result<T, DialerError>;
