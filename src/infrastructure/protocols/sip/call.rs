//! Outbound call dialog
//!
//! Each call runs as its own actor task. The actor exclusively owns the
//! dialog state; hangups and remote BYEs arrive as [`CallCommand`]s and the
//! auto-hangup timer is one of its `select!` branches, so dropping the task
//! cancels every pending wait.

use super::builder::{RequestBuilder, ResponseBuilder};
use super::dialog::{CallEvent, CallState, CallStateMachine, Dialog};
use super::message::{NameAddr, SipMethod, SipRequest, SipResponse};
use super::sdp::SdpSession;
use super::transaction::{generate_branch, TransactionEvent, TransactionLayer, TransactionOutcome};
use crate::domain::auto_hangup::{remaining_seconds_until, AutoHangupTimer};
use crate::domain::shared::{CallAttemptId, Credentials, DialerEvent, EndCause, EventSink, SipUri};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CallParams {
    pub id: CallAttemptId,
    pub number: String,
    pub label: String,
    /// Auto-hangup bounds in seconds, `None` when disabled
    pub auto_hangup: Option<(u64, u64)>,
    pub rtp_port: u16,
}

#[derive(Debug)]
pub enum CallCommand {
    Hangup,
    RemoteBye(SipRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub hangup_deadline: Option<Instant>,
}

/// Delivered to the orchestrator once the dialog is terminal
#[derive(Debug, Clone, PartialEq)]
pub struct CallSummary {
    pub id: CallAttemptId,
    pub number: String,
    pub sip_call_id: String,
    pub state: CallState,
    pub talk_duration: Option<Duration>,
    pub failure: Option<String>,
}

/// Handle on a running call actor
pub struct CallHandle {
    id: CallAttemptId,
    number: String,
    label: String,
    sip_call_id: String,
    commands: mpsc::Sender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub fn id(&self) -> CallAttemptId {
        self.id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sip_call_id(&self) -> &str {
        &self.sip_call_id
    }

    pub fn state(&self) -> CallState {
        self.snapshot.borrow().state
    }

    /// Dialog not yet terminal
    pub fn is_active(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Seconds until auto-hangup, when armed
    pub fn remaining_seconds(&self) -> Option<u64> {
        self.snapshot
            .borrow()
            .hangup_deadline
            .map(remaining_seconds_until)
    }

    pub async fn hangup(&self) {
        if self.commands.send(CallCommand::Hangup).await.is_err() {
            debug!("Call {} already finished", self.id);
        }
    }

    pub async fn remote_bye(&self, request: SipRequest) -> bool {
        self.commands.send(CallCommand::RemoteBye(request)).await.is_ok()
    }

    /// Wait for a terminal state
    pub async fn finished(&self) -> CallState {
        let mut snapshot = self.snapshot.clone();
        let result = snapshot
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| s.state);
        result.unwrap_or(CallState::Terminated)
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Call;

impl Call {
    pub fn spawn(
        params: CallParams,
        layer: Arc<TransactionLayer>,
        credentials: Arc<Credentials>,
        events: Arc<dyn EventSink>,
        completions: mpsc::UnboundedSender<CallSummary>,
    ) -> CallHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot {
            state: CallState::Null,
            hangup_deadline: None,
        });

        let domain = credentials.domain().to_string();
        let local_host = layer.local_addr().ip().to_string();
        let dialog = Dialog::new(
            credentials.aor().to_string(),
            SipUri::new(params.number.clone(), domain, None).to_string(),
            &local_host,
        );
        let sip_call_id = dialog.call_id.clone();

        let handle_fields = (params.id, params.number.clone(), params.label.clone());
        let actor = CallActor {
            params,
            layer,
            credentials,
            events,
            completions,
            dialog,
            machine: CallStateMachine::new(),
            snapshot: snapshot_tx,
            commands: command_rx,
            invite: None,
            failure: None,
        };
        let task = tokio::spawn(actor.run());

        CallHandle {
            id: handle_fields.0,
            number: handle_fields.1,
            label: handle_fields.2,
            sip_call_id,
            commands: command_tx,
            snapshot: snapshot_rx,
            task,
        }
    }
}

enum Setup {
    Answered(SipResponse),
    Finished,
}

struct CallActor {
    params: CallParams,
    layer: Arc<TransactionLayer>,
    credentials: Arc<Credentials>,
    events: Arc<dyn EventSink>,
    completions: mpsc::UnboundedSender<CallSummary>,
    dialog: Dialog,
    machine: CallStateMachine,
    snapshot: watch::Sender<CallSnapshot>,
    commands: mpsc::Receiver<CallCommand>,
    /// INVITE as last sent, after any authenticated retry
    invite: Option<SipRequest>,
    failure: Option<String>,
}

impl CallActor {
    /// Apply a state machine event; illegal transitions are logged and dropped
    fn apply(&mut self, event: CallEvent) -> bool {
        match self.machine.process_event(event) {
            Ok(state) => {
                self.snapshot.send_modify(|s| s.state = state);
                debug!("Call {} -> {}", self.params.id, state.name());
                true
            }
            Err(e) => {
                warn!("Call {}: {}", self.params.id, e);
                false
            }
        }
    }

    fn local_addr(&self) -> NameAddr {
        NameAddr::new(self.dialog.local_uri.clone()).with_tag(self.dialog.local_tag.clone())
    }

    fn remote_addr(&self) -> NameAddr {
        let addr = NameAddr::new(self.dialog.remote_uri.clone());
        match &self.dialog.remote_tag {
            Some(tag) => addr.with_tag(tag.clone()),
            None => addr,
        }
    }

    fn build_invite(&mut self) -> SipRequest {
        let local = self.layer.local_addr();
        let contact = SipUri::new(
            self.credentials.username.clone(),
            local.ip().to_string(),
            Some(local.port()),
        );
        let offer = SdpSession::create_offer(local.ip(), self.params.rtp_port);
        let seq = self.dialog.next_cseq();

        RequestBuilder::new(SipMethod::Invite, self.dialog.remote_uri.clone())
            .via(self.layer.transport_name(), local, &generate_branch())
            .from(&self.local_addr())
            .to(&self.remote_addr())
            .call_id(&self.dialog.call_id)
            .cseq(seq)
            .contact(&contact.to_string())
            .header("Allow", "INVITE, ACK, BYE, OPTIONS")
            .body("application/sdp", offer.to_string())
            .build()
    }

    /// In-dialog request towards the remote target
    fn in_dialog(&self, method: SipMethod, seq: u32) -> RequestBuilder {
        RequestBuilder::new(method, self.dialog.target().to_string())
            .via(self.layer.transport_name(), self.layer.local_addr(), &generate_branch())
            .from(&self.local_addr())
            .to(&self.remote_addr())
            .call_id(&self.dialog.call_id)
            .cseq(seq)
    }

    async fn run(mut self) {
        info!(
            "Placing call {} to {} ({})",
            self.params.id, self.params.number, self.dialog.call_id
        );

        match self.setup().await {
            Setup::Answered(response) => self.established(response).await,
            Setup::Finished => {}
        }

        let summary = CallSummary {
            id: self.params.id,
            number: self.params.number.clone(),
            sip_call_id: self.dialog.call_id.clone(),
            state: self.machine.state(),
            talk_duration: self.machine.stats().talk_duration(),
            failure: self.failure.take(),
        };
        info!("Call {} finished in state {}", self.params.id, summary.state.name());
        let _ = self.completions.send(summary);
    }

    /// INVITE until a final response
    async fn setup(&mut self) -> Setup {
        let invite = self.build_invite();
        self.invite = Some(invite.clone());

        let mut transaction = match self.layer.start(invite, Some(self.credentials.clone())).await {
            Ok(t) => t,
            Err(e) => {
                self.fail(CallEvent::Failure, None, format!("Call failed: {}", e));
                return Setup::Finished;
            }
        };
        self.apply(CallEvent::InviteSent);

        let mut hangup_requested = false;
        loop {
            tokio::select! {
                event = transaction.next_event() => match event {
                    Some(TransactionEvent::Provisional(response)) => self.provisional(&response),
                    Some(TransactionEvent::Completed { outcome, request }) => {
                        if let Some(cseq) = request.cseq() {
                            self.dialog.observe_cseq(cseq.seq);
                        }
                        self.invite = Some(request);
                        return self.completed(outcome, hangup_requested).await;
                    }
                    None => {
                        self.fail(CallEvent::Failure, None, "Call failed: transaction lost".to_string());
                        return Setup::Finished;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(CallCommand::Hangup) | None => {
                        if !hangup_requested {
                            info!("Hangup of call {} requested before answer", self.params.id);
                        }
                        hangup_requested = true;
                    }
                    Some(CallCommand::RemoteBye(request)) => {
                        self.respond(&request, ResponseBuilder::call_does_not_exist()).await;
                    }
                },
            }
        }
    }

    fn provisional(&mut self, response: &SipResponse) {
        match response.status_code {
            100 => {
                self.apply(CallEvent::Trying);
            }
            180 | 183 => {
                let was_ringing = self.machine.state() == CallState::Ringing;
                if self.apply(CallEvent::Ringing) && !was_ringing {
                    info!("Call {} ringing", self.params.id);
                    self.events.emit(DialerEvent::Ringing {
                        call_id: self.params.id,
                    });
                }
            }
            other => debug!("Ignoring provisional {} for call {}", other, self.params.id),
        }
    }

    async fn completed(&mut self, outcome: TransactionOutcome, hangup_requested: bool) -> Setup {
        match outcome {
            TransactionOutcome::Final(response) if response.is_success() => {
                if hangup_requested {
                    self.answer(&response).await;
                    self.emit_established(&response, None);
                    self.bye(EndCause::LocalHangup).await;
                    Setup::Finished
                } else {
                    Setup::Answered(response)
                }
            }
            TransactionOutcome::Final(response) => {
                let reason = format!("Call failed: {} {}", response.status_code, response.reason);
                self.fail(CallEvent::Reject, Some(response.status_code), reason);
                Setup::Finished
            }
            other => {
                let (event, status_code) = match &other {
                    TransactionOutcome::AuthFailure(response) => (CallEvent::Reject, Some(response.status_code)),
                    TransactionOutcome::AuthError(_) => (CallEvent::Reject, None),
                    _ => (CallEvent::Failure, None),
                };
                self.fail(event, status_code, format!("Call failed: {}", other.describe()));
                Setup::Finished
            }
        }
    }

    fn fail(&mut self, event: CallEvent, status_code: Option<u16>, reason: String) {
        warn!("Call {} to {}: {}", self.params.id, self.params.number, reason);
        self.apply(event);
        self.failure = Some(reason.clone());
        self.events.emit(DialerEvent::CallFailed {
            call_id: self.params.id,
            status_code,
            reason,
        });
    }

    /// Record the dialog from the 2xx and ACK it
    async fn answer(&mut self, response: &SipResponse) {
        self.dialog.remote_tag = response.headers.to_addr().and_then(|to| to.tag().map(str::to_string));
        self.dialog.remote_target = response.headers.contact().map(|c| c.uri);
        self.apply(CallEvent::Answer);

        let seq = response
            .cseq()
            .map(|c| c.seq)
            .unwrap_or(self.dialog.local_cseq);
        let mut ack = self.in_dialog(SipMethod::Ack, seq);
        if let Some(invite) = &self.invite {
            for name in ["authorization", "proxy-authorization"] {
                if let Some(value) = invite.headers.get(name) {
                    ack = ack.header(name, value);
                }
            }
        }
        // ACK for a 2xx is its own transaction; no response is expected
        if let Err(e) = self.layer.send_stateless(&ack.build()).await {
            warn!("Failed to send ACK for call {}: {}", self.params.id, e);
        }
    }

    fn emit_established(&mut self, response: &SipResponse, timer: Option<&AutoHangupTimer>) {
        let sdp_answer = response.body_text();
        if let Some(remote) = SdpSession::parse(&sdp_answer).and_then(|s| s.audio_endpoint()) {
            debug!("Call {} remote media at {}:{}", self.params.id, remote.0, remote.1);
        }
        info!("Call {} established", self.params.id);
        self.events.emit(DialerEvent::Established {
            call_id: self.params.id,
            sdp_answer,
            hangup_in_seconds: timer.map(|t| t.remaining_seconds()),
        });
    }

    async fn established(&mut self, response: SipResponse) {
        self.answer(&response).await;

        let timer = self.params.auto_hangup.map(|(min, max)| {
            let timer = AutoHangupTimer::schedule(min, max);
            info!(
                "Auto-hangup for call {} in {:.1}s",
                self.params.id,
                timer.duration().as_secs_f64()
            );
            timer
        });
        self.snapshot
            .send_modify(|s| s.hangup_deadline = timer.map(|t| t.deadline()));
        self.emit_established(&response, timer.as_ref());

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(CallCommand::Hangup) | None => {
                        self.bye(EndCause::LocalHangup).await;
                        return;
                    }
                    Some(CallCommand::RemoteBye(request)) => {
                        self.remote_bye(request).await;
                        return;
                    }
                },
                _ = async { if let Some(t) = &timer { t.expired().await } }, if timer.is_some() => {
                    info!("Auto-hangup fired for call {}", self.params.id);
                    self.bye(EndCause::AutoHangup).await;
                    return;
                }
            }
        }
    }

    async fn bye(&mut self, cause: EndCause) {
        if !self.apply(CallEvent::Bye) {
            return;
        }
        self.snapshot.send_modify(|s| s.hangup_deadline = None);

        let seq = self.dialog.next_cseq();
        let bye = self.in_dialog(SipMethod::Bye, seq).build();
        match self.layer.send(bye, Some(self.credentials.clone())).await {
            Ok(TransactionOutcome::Final(response)) => {
                debug!("BYE for call {} answered {}", self.params.id, response.status_code)
            }
            Ok(other) => warn!("BYE for call {}: {}", self.params.id, other.describe()),
            Err(e) => error!("BYE for call {} not sent: {}", self.params.id, e),
        }

        self.apply(CallEvent::ByeCompleted);
        info!("Call {} ended ({})", self.params.id, cause);
        self.events.emit(DialerEvent::Ended {
            call_id: self.params.id,
            cause,
        });
    }

    async fn remote_bye(&mut self, request: SipRequest) {
        info!("Remote hangup of call {}", self.params.id);
        self.apply(CallEvent::Bye);
        self.snapshot.send_modify(|s| s.hangup_deadline = None);
        self.respond(&request, ResponseBuilder::ok()).await;
        self.apply(CallEvent::ByeCompleted);
        self.events.emit(DialerEvent::Ended {
            call_id: self.params.id,
            cause: EndCause::RemoteHangup,
        });
    }

    async fn respond(&self, request: &SipRequest, builder: ResponseBuilder) {
        let response = builder.build_for_request(request);
        if let Err(e) = self.layer.send_response(&response).await {
            warn!("Failed to answer {} for call {}: {}", request.method, self.params.id, e);
        }
    }
}

