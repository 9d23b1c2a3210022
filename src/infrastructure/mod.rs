//! Infrastructure layer - Technical implementations
//!
//! This layer contains the SIP signaling stack: message codec, transports,
//! client transactions and the registration/call dialogs.

pub mod protocols;
