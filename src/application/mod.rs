//! Application layer - Use cases and application services
//!
//! This layer orchestrates the SIP stack and the domain services behind a
//! single session object driven by the user interface.

pub mod session;

pub use session::{DialerSession, SessionConfig};
