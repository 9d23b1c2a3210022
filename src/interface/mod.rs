//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The health endpoint
//! - The WebSocket control channel used by the UI

pub mod api;
