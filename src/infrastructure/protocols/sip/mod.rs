//! SIP user-agent stack (RFC 3261, client side)
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Dialogs               │
//! │  (Registration, Call)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │  (client TXN, digest)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP, in-memory)       │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call;
pub mod dialog;
pub mod message;
pub mod registration;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::{AuthError, DigestChallenge};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use call::{Call, CallCommand, CallHandle, CallParams, CallSnapshot, CallSummary};
pub use dialog::{CallEvent, CallState, CallStateMachine, Dialog, RegistrationState};
pub use message::{CSeq, Headers, NameAddr, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use registration::{Registration, RegistrationConfig, RegistrationHandle};
pub use sdp::{RtpPortAllocator, SdpSession};
pub use transaction::{
    ClientTransaction, SipTimers, TransactionConfig, TransactionEvent, TransactionKey,
    TransactionLayer, TransactionOutcome,
};
pub use transport::{ChannelPeer, ChannelTransport, IncomingMessage, Transport, TransportProtocol, UdpTransport};
