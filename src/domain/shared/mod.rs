//! Shared kernel - types used by the dialer, the scheduler and the SIP stack

pub mod error;
pub mod events;
pub mod result;
pub mod value_objects;

pub use error::DialerError;
pub use events::{DialerEvent, EndCause, EventSink};
pub use result::Result;
pub use value_objects::*;
