//! API interface implementations

pub mod router;
pub mod websocket;

pub use router::{build_router, health_check, AppState};
pub use websocket::{ClientMessage, ServerMessage};
