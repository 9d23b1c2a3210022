//! Lifecycle events surfaced to the UI

use std::fmt;
use tokio::sync::mpsc;

use super::value_objects::CallAttemptId;

/// Why an established call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    LocalHangup,
    RemoteHangup,
    AutoHangup,
}

impl fmt::Display for EndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndCause::LocalHangup => "local hangup",
            EndCause::RemoteHangup => "remote hangup",
            EndCause::AutoHangup => "auto hangup",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialerEvent {
    Registered,
    RegistrationFailed {
        reason: String,
    },
    CallStarted {
        call_id: CallAttemptId,
        number: String,
        label: String,
    },
    Ringing {
        call_id: CallAttemptId,
    },
    Established {
        call_id: CallAttemptId,
        sdp_answer: String,
        /// Auto-hangup deadline, when one was armed
        hangup_in_seconds: Option<u64>,
    },
    CallFailed {
        call_id: CallAttemptId,
        status_code: Option<u16>,
        reason: String,
    },
    Ended {
        call_id: CallAttemptId,
        cause: EndCause,
    },
}

impl DialerEvent {
    /// Returns the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            DialerEvent::Registered => "registered",
            DialerEvent::RegistrationFailed { .. } => "registration_failed",
            DialerEvent::CallStarted { .. } => "call_started",
            DialerEvent::Ringing { .. } => "ringing",
            DialerEvent::Established { .. } => "established",
            DialerEvent::CallFailed { .. } => "call_failed",
            DialerEvent::Ended { .. } => "ended",
        }
    }
}

/// Fire-and-forget consumer of dialer events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DialerEvent);
}

impl EventSink for mpsc::UnboundedSender<DialerEvent> {
    fn emit(&self, event: DialerEvent) {
        // A closed UI channel only means nobody is listening any more
        let _ = self.send(event);
    }
}
