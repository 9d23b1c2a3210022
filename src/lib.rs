//! sipdialer - SIP softphone and auto-dialer signaling core
//!
//! Registers a SIP account, places outbound calls with digest
//! authentication, hangs them up after a randomized duration and can dial
//! a pool of numbers unattended within working hours.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::DialerError;
pub use domain::shared::result::Result;
