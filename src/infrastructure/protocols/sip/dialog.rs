//! Dialog state machines
//!
//! Registration: `Null -> Registering -> Registered`.
//! Call: `Null -> Calling -> Proceeding -> Ringing -> Established ->
//! Terminating -> Terminated`, with `Failed` reachable from any
//! non-terminal state. Nothing leaves `Terminated` or `Failed`.

use rand::Rng;
use thiserror::Error;
use tokio::time::{Duration, Instant};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    #[error("Illegal transition: {state} + {event}")]
    IllegalTransition { state: &'static str, event: String },
}

/// Call State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Null,
    /// INVITE sent
    Calling,
    /// 100 Trying received
    Proceeding,
    /// 180/183 received (early dialog)
    Ringing,
    /// 2xx received and ACKed
    Established,
    /// BYE sent or received
    Terminating,
    Terminated,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallState::Null => "Null",
            CallState::Calling => "Calling",
            CallState::Proceeding => "Proceeding",
            CallState::Ringing => "Ringing",
            CallState::Established => "Established",
            CallState::Terminating => "Terminating",
            CallState::Terminated => "Terminated",
            CallState::Failed => "Failed",
        }
    }
}

/// Call State Machine Event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    InviteSent,
    /// 100 Trying
    Trying,
    /// 180 Ringing / 183 Session Progress
    Ringing,
    /// 2xx to the INVITE
    Answer,
    /// BYE sent or received
    Bye,
    /// BYE answered or timed out
    ByeCompleted,
    /// 3xx-6xx or an unanswerable challenge
    Reject,
    /// Timeout or transport failure
    Failure,
}

/// Call Statistics
#[derive(Debug, Clone)]
pub struct CallStats {
    pub created_at: Instant,
    pub answered_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    pub provisional_count: u32,
}

impl CallStats {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            answered_at: None,
            ended_at: None,
            provisional_count: 0,
        }
    }

    /// Time from answer to end (or to now while still up)
    pub fn talk_duration(&self) -> Option<Duration> {
        let answered = self.answered_at?;
        let end = self.ended_at.unwrap_or_else(Instant::now);
        Some(end.saturating_duration_since(answered))
    }
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CallStateMachine {
    state: CallState,
    stats: CallStats,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Null,
            stats: CallStats::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Process an event and transition state
    pub fn process_event(&mut self, event: CallEvent) -> Result<CallState, DialogError> {
        use CallEvent as E;
        use CallState as S;

        let new_state = match (self.state, event) {
            (S::Null, E::InviteSent) => S::Calling,

            (S::Calling | S::Proceeding, E::Trying) => S::Proceeding,
            (S::Ringing, E::Trying) => S::Ringing,
            (S::Calling | S::Proceeding | S::Ringing, E::Ringing) => S::Ringing,
            (S::Calling | S::Proceeding | S::Ringing, E::Answer) => S::Established,
            (S::Calling | S::Proceeding | S::Ringing, E::Reject) => S::Failed,

            (S::Established, E::Bye) => S::Terminating,
            (S::Terminating, E::ByeCompleted) => S::Terminated,

            (state, E::Failure) if !state.is_terminal() => S::Failed,

            (state, event) => {
                return Err(DialogError::IllegalTransition {
                    state: state.name(),
                    event: format!("{:?}", event),
                })
            }
        };

        match event {
            E::Trying | E::Ringing => self.stats.provisional_count += 1,
            E::Answer => self.stats.answered_at = Some(Instant::now()),
            _ => {}
        }
        if new_state.is_terminal() || new_state == S::Terminating {
            self.stats.ended_at.get_or_insert_with(Instant::now);
        }

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Null,
    Registering,
    Registered,
    Terminated,
    Failed,
}

impl RegistrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationState::Terminated | RegistrationState::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Null => "Null",
            RegistrationState::Registering => "Registering",
            RegistrationState::Registered => "Registered",
            RegistrationState::Terminated => "Terminated",
            RegistrationState::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEvent {
    RegisterSent,
    /// Refresh REGISTER sent while registered
    RefreshSent,
    Success,
    Failure,
    Unregistered,
}

pub struct RegistrationStateMachine {
    state: RegistrationState,
}

impl RegistrationStateMachine {
    pub fn new() -> Self {
        Self {
            state: RegistrationState::Null,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn process_event(
        &mut self,
        event: RegistrationEvent,
    ) -> Result<RegistrationState, DialogError> {
        use RegistrationEvent as E;
        use RegistrationState as S;

        let new_state = match (self.state, event) {
            (S::Null, E::RegisterSent) => S::Registering,
            (S::Registering, E::Success) => S::Registered,
            (S::Registered, E::RefreshSent | E::Success) => S::Registered,
            (S::Registering | S::Registered, E::Failure) => S::Failed,
            (S::Registering | S::Registered, E::Unregistered) => S::Terminated,
            (state, event) => {
                return Err(DialogError::IllegalTransition {
                    state: state.name(),
                    event: format!("{:?}", event),
                })
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for RegistrationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Dialog identifiers and sequencing shared by registrations and calls
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    /// Last CSeq number used; the next request uses `local_cseq + 1`
    pub local_cseq: u32,
    pub local_uri: String,
    pub remote_uri: String,
    /// Contact of the remote party, target of in-dialog requests
    pub remote_target: Option<String>,
}

impl Dialog {
    pub fn new(local_uri: String, remote_uri: String, host: &str) -> Self {
        Self {
            call_id: generate_call_id(host),
            local_tag: generate_tag(),
            remote_tag: None,
            local_cseq: 0,
            local_uri,
            remote_uri,
            remote_target: None,
        }
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Account for a CSeq consumed by an authenticated retry
    pub fn observe_cseq(&mut self, used: u32) {
        self.local_cseq = self.local_cseq.max(used);
    }

    /// Where in-dialog requests go
    pub fn target(&self) -> &str {
        self.remote_target.as_deref().unwrap_or(&self.remote_uri)
    }
}

pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

pub fn generate_call_id(host: &str) -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{:x}@{}",
        chrono::Utc::now().timestamp_millis(),
        rng.gen::<u64>(),
        host
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_state_transitions() {
        let mut sm = CallStateMachine::new();
        assert_eq!(sm.state(), CallState::Null);

        sm.process_event(CallEvent::InviteSent).unwrap();
        assert_eq!(sm.state(), CallState::Calling);

        sm.process_event(CallEvent::Trying).unwrap();
        assert_eq!(sm.state(), CallState::Proceeding);

        sm.process_event(CallEvent::Ringing).unwrap();
        assert_eq!(sm.state(), CallState::Ringing);

        sm.process_event(CallEvent::Answer).unwrap();
        assert_eq!(sm.state(), CallState::Established);
        assert!(sm.stats().answered_at.is_some());

        sm.process_event(CallEvent::Bye).unwrap();
        assert_eq!(sm.state(), CallState::Terminating);

        sm.process_event(CallEvent::ByeCompleted).unwrap();
        assert_eq!(sm.state(), CallState::Terminated);
        assert!(sm.stats().talk_duration().is_some());
    }

    #[test]
    fn test_fast_answer() {
        let mut sm = CallStateMachine::new();
        sm.process_event(CallEvent::InviteSent).unwrap();
        sm.process_event(CallEvent::Answer).unwrap();
        assert_eq!(sm.state(), CallState::Established);
    }

    #[test]
    fn test_call_rejection() {
        let mut sm = CallStateMachine::new();
        sm.process_event(CallEvent::InviteSent).unwrap();
        sm.process_event(CallEvent::Ringing).unwrap();

        sm.process_event(CallEvent::Reject).unwrap();
        assert_eq!(sm.state(), CallState::Failed);
        assert!(sm.stats().ended_at.is_some());
    }

    #[test]
    fn test_failure_from_any_live_state() {
        for events in [
            vec![CallEvent::InviteSent],
            vec![CallEvent::InviteSent, CallEvent::Trying],
            vec![CallEvent::InviteSent, CallEvent::Answer],
            vec![CallEvent::InviteSent, CallEvent::Answer, CallEvent::Bye],
        ] {
            let mut sm = CallStateMachine::new();
            for event in events {
                sm.process_event(event).unwrap();
            }
            assert_eq!(sm.process_event(CallEvent::Failure), Ok(CallState::Failed));
        }
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let all = [
            CallEvent::InviteSent,
            CallEvent::Trying,
            CallEvent::Ringing,
            CallEvent::Answer,
            CallEvent::Bye,
            CallEvent::ByeCompleted,
            CallEvent::Reject,
            CallEvent::Failure,
        ];

        let mut failed = CallStateMachine::new();
        failed.process_event(CallEvent::InviteSent).unwrap();
        failed.process_event(CallEvent::Reject).unwrap();

        let mut terminated = CallStateMachine::new();
        for event in [CallEvent::InviteSent, CallEvent::Answer, CallEvent::Bye, CallEvent::ByeCompleted] {
            terminated.process_event(event).unwrap();
        }

        for sm in [&mut failed, &mut terminated] {
            let before = sm.state();
            for event in all {
                assert!(matches!(
                    sm.process_event(event),
                    Err(DialogError::IllegalTransition { .. })
                ));
                assert_eq!(sm.state(), before);
            }
        }
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = CallStateMachine::new();
        sm.process_event(CallEvent::InviteSent).unwrap();
        sm.process_event(CallEvent::Answer).unwrap();

        assert!(sm.process_event(CallEvent::Answer).is_err());
        assert_eq!(sm.state(), CallState::Established);
    }

    #[test]
    fn test_registration_transitions() {
        let mut sm = RegistrationStateMachine::new();
        sm.process_event(RegistrationEvent::RegisterSent).unwrap();
        assert_eq!(sm.state(), RegistrationState::Registering);
        sm.process_event(RegistrationEvent::Success).unwrap();
        assert_eq!(sm.state(), RegistrationState::Registered);
        sm.process_event(RegistrationEvent::RefreshSent).unwrap();
        sm.process_event(RegistrationEvent::Success).unwrap();
        assert_eq!(sm.state(), RegistrationState::Registered);
        sm.process_event(RegistrationEvent::Unregistered).unwrap();
        assert_eq!(sm.state(), RegistrationState::Terminated);
        assert!(sm.process_event(RegistrationEvent::RegisterSent).is_err());
    }

    #[test]
    fn test_registration_failure_absorbing() {
        let mut sm = RegistrationStateMachine::new();
        sm.process_event(RegistrationEvent::RegisterSent).unwrap();
        sm.process_event(RegistrationEvent::Failure).unwrap();
        assert_eq!(sm.state(), RegistrationState::Failed);
        assert!(sm.process_event(RegistrationEvent::Success).is_err());
        assert_eq!(sm.state(), RegistrationState::Failed);
    }

    #[test]
    fn test_dialog_cseq_monotonic() {
        let mut dialog = Dialog::new(
            "sip:alice@example.com".to_string(),
            "sip:100@example.com".to_string(),
            "10.0.0.1",
        );
        assert_eq!(dialog.next_cseq(), 1);
        dialog.observe_cseq(2);
        assert_eq!(dialog.next_cseq(), 3);
        dialog.observe_cseq(1);
        assert_eq!(dialog.next_cseq(), 4);
        assert_eq!(dialog.target(), "sip:100@example.com");
        assert!(dialog.call_id.ends_with("@10.0.0.1"));
    }
}
