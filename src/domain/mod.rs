//! Domain layer - Core dialer rules
//!
//! This layer contains:
//! - Shared kernel: identifiers, credentials, events, errors
//! - Number registry: the dialable pool and per-number statistics
//! - Auto-hangup: randomized call lifetime
//! - Auto-dialer: the unattended call scheduler

pub mod auto_dialer;
pub mod auto_hangup;
pub mod number_registry;
pub mod shared;

// Re-export commonly used types
pub use shared::{DialerError, Result};
