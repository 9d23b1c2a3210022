//! SIP Transaction Layer, client side
//!
//! One client transaction per outbound request (RFC 3261 Section 17.1).
//! Responses are matched on Call-ID + CSeq number + CSeq method, so a
//! response reaches exactly the transaction that issued the request.
//!
//! ## Outcomes
//! Every transaction resolves to a [`TransactionOutcome`] value:
//! - `Final` for any non-challenge final response
//! - `AuthFailure` when a challenge cannot be answered (second challenge,
//!   no credentials)
//! - `AuthError` when the challenge itself is unusable
//! - `Timeout` / `TransportError` when nothing usable came back

use super::auth::{
    authorization_header_name, challenge_header_name, compute_authorization, generate_cnonce,
    AuthError, DigestChallenge,
};
use super::message::{CSeq, Headers, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{IncomingMessage, Transport};
use crate::domain::shared::Credentials;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 32;
const REQUEST_QUEUE: usize = 100;

/// Generate a new RFC 3261 branch parameter
pub fn generate_branch() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("z9hG4bK{:x}", random)
}

/// Replace the `branch` parameter of a Via value
fn with_branch(via: &str, branch: &str) -> String {
    let mut replaced = false;
    let mut parts: Vec<String> = via
        .split(';')
        .map(|p| {
            if p.trim().starts_with("branch=") {
                replaced = true;
                format!("branch={}", branch)
            } else {
                p.to_string()
            }
        })
        .collect();
    if !replaced {
        parts.push(format!("branch={}", branch));
    }
    parts.join(";")
}

/// Transaction key: Call-ID + CSeq number + CSeq method
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub call_id: String,
    pub seq: u32,
    pub method: SipMethod,
}

impl TransactionKey {
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let call_id = headers.call_id()?;
        let CSeq { seq, method } = headers.cseq()?;
        Some(Self {
            call_id: call_id.to_string(),
            seq,
            method,
        })
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {}", self.call_id, self.seq, self.method)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T2: Maximum retransmit interval (default 4s)
    pub t2: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionConfig {
    pub timers: SipTimers,
    /// Time without any response before the transaction times out.
    /// Restarted by every provisional response.
    pub timeout: Duration,
    /// Retransmit the request (Timers A/E) until the first response
    pub retransmit: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timers: SipTimers::default(),
            timeout: Duration::from_secs(32),
            retransmit: true,
        }
    }
}

/// Client transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    ChallengedRetry,
    Completed,
    TimedOut,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::TimedOut)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Trying => "Trying",
            TransactionState::ChallengedRetry => "ChallengedRetry",
            TransactionState::Completed => "Completed",
            TransactionState::TimedOut => "TimedOut",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Final(SipResponse),
    /// Challenge that could not be answered; carries the challenging response
    AuthFailure(SipResponse),
    AuthError(AuthError),
    Timeout,
    TransportError(String),
}

impl TransactionOutcome {
    /// Human-readable reason, used for failure events
    pub fn describe(&self) -> String {
        match self {
            TransactionOutcome::Final(resp) => format!("{} {}", resp.status_code, resp.reason),
            TransactionOutcome::AuthFailure(resp) => format!(
                "authentication failed ({} {})",
                resp.status_code, resp.reason
            ),
            TransactionOutcome::AuthError(e) => format!("authentication error: {}", e),
            TransactionOutcome::Timeout => "no response from SIP server".to_string(),
            TransactionOutcome::TransportError(e) => format!("transport error: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    Provisional(SipResponse),
    Completed {
        outcome: TransactionOutcome,
        /// Request snapshot last sent (after any authenticated retry)
        request: SipRequest,
    },
}

/// What the driver must do after feeding a response to a [`Transaction`]
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Provisional(SipResponse),
    Retry(SipRequest),
    Done(TransactionOutcome),
}

/// Client transaction state machine, free of I/O
#[derive(Debug, Clone)]
pub struct Transaction {
    pub request: SipRequest,
    pub state: TransactionState,
    pub retry_count: u8,
}

impl Transaction {
    pub fn new(request: SipRequest) -> Result<Self, SipError> {
        if TransactionKey::from_headers(&request.headers).is_none() {
            return Err(SipError::InvalidMessage(format!(
                "{} request without Call-ID or CSeq",
                request.method
            )));
        }
        Ok(Self {
            request,
            state: TransactionState::Trying,
            retry_count: 0,
        })
    }

    pub fn key(&self) -> Option<TransactionKey> {
        TransactionKey::from_headers(&self.request.headers)
    }

    pub fn on_response(&mut self, response: SipResponse, credentials: Option<&Credentials>) -> Step {
        if response.is_provisional() {
            return Step::Provisional(response);
        }

        if response.is_auth_challenge() {
            if self.retry_count > 0 {
                warn!(
                    "Second {} challenge for {} {}, giving up",
                    response.status_code, self.request.method, self.request.uri
                );
                self.state = TransactionState::Completed;
                return Step::Done(TransactionOutcome::AuthFailure(response));
            }

            let Some(credentials) = credentials else {
                self.state = TransactionState::Completed;
                return Step::Done(TransactionOutcome::AuthFailure(response));
            };

            return match authenticated_retry(&self.request, &response, credentials) {
                Ok(retry) => {
                    self.state = TransactionState::ChallengedRetry;
                    self.retry_count = 1;
                    self.request = retry.clone();
                    Step::Retry(retry)
                }
                Err(e) => {
                    self.state = TransactionState::Completed;
                    Step::Done(TransactionOutcome::AuthError(e))
                }
            };
        }

        self.state = TransactionState::Completed;
        Step::Done(TransactionOutcome::Final(response))
    }

    pub fn on_timeout(&mut self) -> Step {
        self.state = TransactionState::TimedOut;
        Step::Done(TransactionOutcome::Timeout)
    }
}

/// Derive the request answering a 401/407: credentials added, CSeq + 1 and
/// a fresh Via branch
pub fn authenticated_retry(
    request: &SipRequest,
    challenge: &SipResponse,
    credentials: &Credentials,
) -> Result<SipRequest, AuthError> {
    let header_value = challenge
        .headers
        .get(challenge_header_name(challenge.status_code))
        .ok_or(AuthError::IncompleteChallenge("challenge header"))?;
    let challenge_params = DigestChallenge::parse(header_value)?;

    let authorization = compute_authorization(
        &credentials.username,
        &credentials.password,
        request.method.as_str(),
        &request.uri,
        &challenge_params,
        &generate_cnonce(),
    );

    let mut retry = request.clone();
    retry
        .headers
        .set(authorization_header_name(challenge.status_code), authorization);

    if let Some(cseq) = request.cseq() {
        retry
            .headers
            .set("cseq", CSeq::new(cseq.seq + 1, cseq.method).to_string());
    }
    if let Some(via) = request.headers.get("via") {
        retry.headers.set("via", with_branch(via, &generate_branch()));
    }

    Ok(retry)
}

/// ACK for a non-2xx final response to an INVITE (RFC 3261 Section 17.1.1.3).
/// Same branch and CSeq number as the INVITE; the To header, with its tag,
/// comes from the response.
pub fn ack_for_failure(invite: &SipRequest, response: &SipResponse) -> SipRequest {
    let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
    if let Some(via) = invite.headers.get("via") {
        ack.headers.push("Via", via);
    }
    for name in ["from", "call-id", "max-forwards"] {
        if let Some(value) = invite.headers.get(name) {
            ack.headers.push(name, value);
        }
    }
    if let Some(to) = response.headers.get("to") {
        ack.headers.push("To", to);
    }
    if let Some(cseq) = invite.cseq() {
        ack.headers.push("CSeq", CSeq::new(cseq.seq, SipMethod::Ack).to_string());
    }
    for route in invite.headers.get_all("route") {
        ack.headers.push("Route", route);
    }
    ack
}

/// Handle on a running client transaction
pub struct ClientTransaction {
    key: TransactionKey,
    events: mpsc::Receiver<TransactionEvent>,
}

impl ClientTransaction {
    /// Key of the original request
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Next event; `None` once `Completed` has been delivered
    pub async fn next_event(&mut self) -> Option<TransactionEvent> {
        self.events.recv().await
    }

    /// Skip provisional responses and wait for the outcome
    pub async fn outcome(mut self) -> (TransactionOutcome, Option<SipRequest>) {
        while let Some(event) = self.events.recv().await {
            if let TransactionEvent::Completed { outcome, request } = event {
                return (outcome, Some(request));
            }
        }
        (TransactionOutcome::Timeout, None)
    }
}

type PendingMap = Arc<RwLock<HashMap<TransactionKey, mpsc::Sender<SipResponse>>>>;

/// Transaction Layer - owns the pending-transaction table and the
/// dispatcher that routes inbound messages
pub struct TransactionLayer {
    transport: Arc<dyn Transport>,
    config: TransactionConfig,
    pending: PendingMap,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionLayer {
    /// Create the layer and start dispatching `inbound`.
    /// Inbound requests are forwarded on the returned receiver.
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<IncomingMessage>,
        config: TransactionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SipRequest>) {
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);

        let dispatcher = tokio::spawn(Self::dispatch_loop(inbound, pending.clone(), request_tx));
        info!("Transaction layer started");

        (
            Arc::new(Self {
                transport,
                config,
                pending,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
            request_rx,
        )
    }

    async fn dispatch_loop(
        mut inbound: mpsc::Receiver<IncomingMessage>,
        pending: PendingMap,
        requests: mpsc::Sender<SipRequest>,
    ) {
        while let Some(incoming) = inbound.recv().await {
            match incoming.message {
                SipMessage::Response(response) => {
                    let Some(key) = TransactionKey::from_headers(&response.headers) else {
                        warn!(
                            "Dropping {} response from {} without Call-ID/CSeq",
                            response.status_code, incoming.source
                        );
                        continue;
                    };

                    let sender = pending.read().await.get(&key).cloned();
                    match sender {
                        Some(tx) => {
                            if tx.send(response).await.is_err() {
                                debug!("Transaction {} finished before response arrived", key);
                            }
                        }
                        None => {
                            warn!(
                                "Dropping stray {} response for {}",
                                response.status_code, key
                            );
                        }
                    }
                }
                SipMessage::Request(request) => {
                    debug!("Received {} request from {}", request.method, incoming.source);
                    if requests.send(request).await.is_err() {
                        debug!("Request handler gone, dropping inbound request");
                    }
                }
            }
        }
        debug!("Inbound channel closed, dispatcher exiting");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.protocol().as_str()
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Start a client transaction for `request`
    pub async fn start(
        &self,
        request: SipRequest,
        credentials: Option<Arc<Credentials>>,
    ) -> Result<ClientTransaction, SipError> {
        let transaction = Transaction::new(request)?;
        let key = transaction
            .key()
            .ok_or_else(|| SipError::InvalidMessage("request without key".to_string()))?;

        let (response_tx, response_rx) = mpsc::channel(EVENT_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        self.pending.write().await.insert(key.clone(), response_tx.clone());
        info!(
            "Created client transaction {} for {} request to {}",
            key, transaction.request.method, transaction.request.uri
        );

        let driver = TransactionDriver {
            transport: self.transport.clone(),
            config: self.config,
            pending: self.pending.clone(),
            response_tx,
            response_rx,
            events: event_tx,
            credentials,
        };
        tokio::spawn(driver.run(transaction, key.clone()));

        Ok(ClientTransaction {
            key,
            events: event_rx,
        })
    }

    /// Run a transaction to completion, ignoring provisional responses
    pub async fn send(
        &self,
        request: SipRequest,
        credentials: Option<Arc<Credentials>>,
    ) -> Result<TransactionOutcome, SipError> {
        let transaction = self.start(request, credentials).await?;
        Ok(transaction.outcome().await.0)
    }

    /// Send a request without a transaction (ACK)
    pub async fn send_stateless(&self, request: &SipRequest) -> Result<(), SipError> {
        debug!("Sending stateless {} to {}", request.method, request.uri);
        self.transport.send(request.to_bytes()).await
    }

    /// Send a response to an inbound request
    pub async fn send_response(&self, response: &SipResponse) -> Result<(), SipError> {
        debug!("Sending {} response", response.status_code);
        self.transport.send(response.to_bytes()).await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub fn stop(&self) {
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                info!("Stopping transaction layer");
                handle.abort();
            }
        }
        self.transport.close();
    }
}

impl Drop for TransactionLayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Task driving one client transaction
struct TransactionDriver {
    transport: Arc<dyn Transport>,
    config: TransactionConfig,
    pending: PendingMap,
    response_tx: mpsc::Sender<SipResponse>,
    response_rx: mpsc::Receiver<SipResponse>,
    events: mpsc::Sender<TransactionEvent>,
    credentials: Option<Arc<Credentials>>,
}

impl TransactionDriver {
    async fn run(mut self, mut transaction: Transaction, mut key: TransactionKey) {
        let outcome = 'attempts: loop {
            if let Err(e) = self.transport.send(transaction.request.to_bytes()).await {
                warn!("Failed to send {}: {}", key, e);
                break TransactionOutcome::TransportError(e.to_string());
            }

            let timers = self.config.timers;
            let mut deadline = Instant::now() + self.config.timeout;
            let mut interval = timers.t1;
            let mut next_retransmit = self.config.retransmit.then(|| Instant::now() + interval);

            loop {
                tokio::select! {
                    response = self.response_rx.recv() => {
                        let Some(response) = response else {
                            break 'attempts TransactionOutcome::Timeout;
                        };
                        // Any response stops retransmission (Timers A/E)
                        next_retransmit = None;

                        if transaction.request.method == SipMethod::Invite && response.status_code >= 300 {
                            let ack = ack_for_failure(&transaction.request, &response);
                            if let Err(e) = self.transport.send(ack.to_bytes()).await {
                                warn!("Failed to ACK {} for {}: {}", response.status_code, key, e);
                            }
                        }

                        match transaction.on_response(response, self.credentials.as_deref()) {
                            Step::Provisional(response) => {
                                debug!("{} got provisional {}", key, response.status_code);
                                deadline = Instant::now() + self.config.timeout;
                                let _ = self.events.send(TransactionEvent::Provisional(response)).await;
                            }
                            Step::Retry(request) => {
                                let Some(retry_key) = TransactionKey::from_headers(&request.headers) else {
                                    break 'attempts TransactionOutcome::TransportError(
                                        "retry request lost its key".to_string(),
                                    );
                                };
                                info!("Retrying {} with credentials as {}", key, retry_key);
                                {
                                    let mut pending = self.pending.write().await;
                                    pending.remove(&key);
                                    pending.insert(retry_key.clone(), self.response_tx.clone());
                                }
                                key = retry_key;
                                continue 'attempts;
                            }
                            Step::Done(outcome) => break 'attempts outcome,
                        }
                    }
                    _ = sleep_until(deadline) => {
                        warn!("Transaction {} timed out", key);
                        match transaction.on_timeout() {
                            Step::Done(outcome) => break 'attempts outcome,
                            _ => break 'attempts TransactionOutcome::Timeout,
                        }
                    }
                    _ = sleep_until(next_retransmit.unwrap_or(deadline)), if next_retransmit.is_some() => {
                        debug!("Retransmitting {} after {:?}", key, interval);
                        if let Err(e) = self.transport.send(transaction.request.to_bytes()).await {
                            warn!("Failed to retransmit {}: {}", key, e);
                            break 'attempts TransactionOutcome::TransportError(e.to_string());
                        }
                        interval = (interval * 2).min(timers.t2);
                        next_retransmit = Some(Instant::now() + interval);
                    }
                }
            }
        };

        self.pending.write().await.remove(&key);
        debug!(
            "Transaction {} {} ({})",
            key,
            transaction.state.name(),
            outcome.describe()
        );
        let _ = self
            .events
            .send(TransactionEvent::Completed {
                outcome,
                request: transaction.request,
            })
            .await;
    }
}
