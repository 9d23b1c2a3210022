//! Registration dialog
//!
//! One actor task per registration. It owns the registration state machine,
//! sends the initial REGISTER, refreshes it before the granted expiry and
//! unregisters (`Expires: 0`) on request.

use super::builder::RequestBuilder;
use super::dialog::{Dialog, DialogError, RegistrationEvent, RegistrationState, RegistrationStateMachine};
use super::message::{NameAddr, SipMethod, SipRequest, SipResponse};
use super::transaction::{generate_branch, TransactionLayer, TransactionOutcome};
use crate::domain::shared::{Credentials, DialerEvent, EventSink, SipUri};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RegistrationConfig {
    /// Requested registration lifetime in seconds
    pub expires: u32,
    /// Fraction of the granted lifetime after which the refresh is sent
    pub refresh_ratio: f64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            expires: 3600,
            refresh_ratio: 0.9,
        }
    }
}

enum RegistrationCommand {
    Unregister(oneshot::Sender<()>),
}

enum RegisterAttempt {
    Granted(u32),
    Failed(String),
    /// An unregister command (or a dropped handle) cut the wait short
    Interrupted(Option<oneshot::Sender<()>>),
}

/// Handle on a running registration actor
pub struct RegistrationHandle {
    commands: mpsc::Sender<RegistrationCommand>,
    state: watch::Receiver<RegistrationState>,
    task: JoinHandle<()>,
}

impl RegistrationHandle {
    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == RegistrationState::Registered
    }

    /// Wait until the registration leaves `Null`/`Registering`
    pub async fn settled(&self) -> RegistrationState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|s| !matches!(s, RegistrationState::Null | RegistrationState::Registering))
            .await
            .map(|s| *s);
        result.unwrap_or(RegistrationState::Terminated)
    }

    /// Send `Expires: 0` and stop the actor. Returns once done.
    pub async fn unregister(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(RegistrationCommand::Unregister(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct RegistrationActor {
    layer: Arc<TransactionLayer>,
    credentials: Arc<Credentials>,
    config: RegistrationConfig,
    events: Arc<dyn EventSink>,
    dialog: Dialog,
    machine: RegistrationStateMachine,
    state_tx: watch::Sender<RegistrationState>,
    commands: mpsc::Receiver<RegistrationCommand>,
}

pub struct Registration;

impl Registration {
    pub fn spawn(
        layer: Arc<TransactionLayer>,
        credentials: Arc<Credentials>,
        config: RegistrationConfig,
        events: Arc<dyn EventSink>,
    ) -> RegistrationHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(RegistrationState::Null);

        let aor = credentials.aor().to_string();
        let local_host = layer.local_addr().ip().to_string();
        let actor = RegistrationActor {
            dialog: Dialog::new(aor.clone(), aor, &local_host),
            layer,
            credentials,
            config,
            events,
            machine: RegistrationStateMachine::new(),
            state_tx,
            commands: command_rx,
        };
        let task = tokio::spawn(actor.run());

        RegistrationHandle {
            commands: command_tx,
            state: state_rx,
            task,
        }
    }
}

impl RegistrationActor {
    fn apply(&mut self, event: RegistrationEvent) -> Result<RegistrationState, DialogError> {
        let result = self.machine.process_event(event);
        match &result {
            Ok(state) => {
                self.state_tx.send_replace(*state);
            }
            Err(e) => warn!("Registration {}: {}", self.dialog.call_id, e),
        }
        result
    }

    fn build_register(&mut self, expires: u32) -> SipRequest {
        let local = self.layer.local_addr();
        let domain = self.credentials.domain().to_string();
        let contact = SipUri::new(
            self.credentials.username.clone(),
            local.ip().to_string(),
            Some(local.port()),
        );
        let from = NameAddr::new(self.dialog.local_uri.clone()).with_tag(self.dialog.local_tag.clone());
        let to = NameAddr::new(self.dialog.remote_uri.clone());
        let seq = self.dialog.next_cseq();

        RequestBuilder::new(SipMethod::Register, SipUri::host_only(domain).to_string())
            .via(self.layer.transport_name(), local, &generate_branch())
            .from(&from)
            .to(&to)
            .call_id(&self.dialog.call_id)
            .cseq(seq)
            .contact(&contact.to_string())
            .expires(expires)
            .build()
    }

    /// Send one REGISTER and wait for its outcome, unless an unregister
    /// command arrives first
    async fn register_once(&mut self, expires: u32) -> RegisterAttempt {
        let request = self.build_register(expires);
        let transaction = match self.layer.start(request, Some(self.credentials.clone())).await {
            Ok(t) => t,
            Err(e) => return RegisterAttempt::Failed(format!("Registration failed: {}", e)),
        };

        let (outcome, last_request) = tokio::select! {
            result = transaction.outcome() => result,
            command = self.commands.recv() => {
                return RegisterAttempt::Interrupted(command.map(|RegistrationCommand::Unregister(reply)| reply));
            }
        };

        if let Some(seq) = last_request.as_ref().and_then(|r| r.cseq()).map(|c| c.seq) {
            self.dialog.observe_cseq(seq);
        }

        match outcome {
            TransactionOutcome::Final(response) if response.is_success() => {
                RegisterAttempt::Granted(granted_expiry(&response, expires))
            }
            TransactionOutcome::Timeout => RegisterAttempt::Failed(
                "No response from SIP server. Check server address and network connectivity."
                    .to_string(),
            ),
            other => RegisterAttempt::Failed(format!("Registration failed: {}", other.describe())),
        }
    }

    fn interrupted(&mut self, reply: Option<oneshot::Sender<()>>) {
        info!("Registration {} cancelled", self.dialog.call_id);
        let _ = self.apply(RegistrationEvent::Unregistered);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn run(mut self) {
        info!(
            "Registering {} with {}:{}",
            self.credentials.aor(),
            self.credentials.sip_server,
            self.credentials.port
        );
        if self.apply(RegistrationEvent::RegisterSent).is_err() {
            return;
        }

        let mut granted = match self.register_once(self.config.expires).await {
            RegisterAttempt::Granted(granted) => granted,
            RegisterAttempt::Failed(reason) => {
                self.fail(reason);
                return;
            }
            RegisterAttempt::Interrupted(reply) => {
                self.interrupted(reply);
                return;
            }
        };

        if self.apply(RegistrationEvent::Success).is_err() {
            return;
        }
        info!("Registered {} for {}s", self.credentials.aor(), granted);
        self.events.emit(DialerEvent::Registered);

        loop {
            let delay = refresh_delay(granted, self.config.refresh_ratio);
            debug!("Registration refresh scheduled in {:?}", delay);

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(RegistrationCommand::Unregister(reply)) => {
                            self.unregister().await;
                            let _ = reply.send(());
                        }
                        None => debug!("Registration handle dropped"),
                    }
                    return;
                }
                _ = sleep_until(Instant::now() + delay) => {
                    if self.apply(RegistrationEvent::RefreshSent).is_err() {
                        return;
                    }
                    match self.register_once(self.config.expires).await {
                        RegisterAttempt::Granted(new_grant) => {
                            debug!("Registration refreshed for {}s", new_grant);
                            let _ = self.apply(RegistrationEvent::Success);
                            granted = new_grant;
                        }
                        RegisterAttempt::Failed(reason) => {
                            self.fail(format!("Registration refresh failed: {}", reason));
                            return;
                        }
                        RegisterAttempt::Interrupted(reply) => {
                            self.interrupted(reply);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn unregister(&mut self) {
        info!("Unregistering {}", self.credentials.aor());
        let request = self.build_register(0);
        match self.layer.send(request, Some(self.credentials.clone())).await {
            Ok(TransactionOutcome::Final(response)) if response.is_success() => {}
            Ok(other) => warn!("Unregister not confirmed: {}", other.describe()),
            Err(e) => warn!("Unregister failed: {}", e),
        }
        let _ = self.apply(RegistrationEvent::Unregistered);
    }

    fn fail(&mut self, reason: String) {
        error!("Registration {} failed: {}", self.dialog.call_id, reason);
        let _ = self.apply(RegistrationEvent::Failure);
        self.events.emit(DialerEvent::RegistrationFailed { reason });
    }
}

/// Lifetime granted by the registrar: Contact `expires` param, then the
/// `Expires` header, then what was requested
fn granted_expiry(response: &SipResponse, requested: u32) -> u32 {
    response
        .headers
        .contact()
        .and_then(|c| c.param("expires").and_then(|v| v.parse().ok()))
        .or_else(|| response.headers.expires())
        .filter(|&e| e > 0)
        .unwrap_or(requested)
}

fn refresh_delay(granted: u32, ratio: f64) -> Duration {
    let secs = (f64::from(granted) * ratio).max(1.0);
    Duration::from_millis((secs * 1000.0) as u64)
}
