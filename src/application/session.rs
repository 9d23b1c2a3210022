//! Dialer session
//!
//! Top-level orchestrator driven by the UI: owns the transaction layer, the
//! registration, the set of live call dialogs and the auto-dialer. Inbound
//! requests that no client transaction claims land here.

use crate::config::Config;
use crate::domain::auto_dialer::{AutoDialer, CallLauncher, Clock, DialerStatus, PollIntervals, SchedulerSettings, SystemClock};
use crate::domain::auto_hangup::AutoHangupConfig;
use crate::domain::number_registry::NumberRegistry;
use crate::domain::shared::{
    normalize_number, CallAttemptId, Credentials, DialerError, DialerEvent, EventSink, NumberEntry, Result,
};
use crate::infrastructure::protocols::sip::{
    Call, CallHandle, CallParams, CallSummary, IncomingMessage, RegistrationConfig,
    RegistrationHandle, RegistrationState, Registration, ResponseBuilder, RtpPortAllocator, SipMethod,
    SipRequest, TransactionConfig, TransactionLayer, Transport, UdpTransport,
};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bind_address: IpAddr,
    pub local_port: u16,
    pub advertised_ip: Option<IpAddr>,
    pub transaction: TransactionConfig,
    pub registration: RegistrationConfig,
    pub auto_hangup: AutoHangupConfig,
    pub rtp_base_port: u16,
    pub rtp_port_count: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        let bind_address = config.sip.bind_address.parse().unwrap_or_else(|_| {
            warn!("Invalid SIP bind address {:?}, using 0.0.0.0", config.sip.bind_address);
            IpAddr::from([0, 0, 0, 0])
        });
        Self {
            bind_address,
            local_port: config.sip.local_port,
            advertised_ip: config.sip.advertised_ip,
            transaction: config.sip.transaction_config(),
            registration: config.sip.registration_config(),
            auto_hangup: config.auto_hangup,
            rtp_base_port: config.sip.rtp_base_port,
            rtp_port_count: config.sip.rtp_port_count,
        }
    }
}

/// A live call as shown to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCall {
    pub call_id: CallAttemptId,
    pub number: String,
    pub label: String,
    pub state: &'static str,
    pub remaining_seconds: Option<u64>,
}

/// Transport and registration for one set of credentials
struct Connection {
    layer: Arc<TransactionLayer>,
    credentials: Arc<Credentials>,
    registration: RegistrationHandle,
    inbound: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    events: Arc<dyn EventSink>,
    registry: Arc<dyn NumberRegistry>,
    connection: RwLock<Option<Connection>>,
    calls: RwLock<HashMap<CallAttemptId, CallHandle>>,
    rtp_ports: RtpPortAllocator,
    completions: mpsc::UnboundedSender<CallSummary>,
}

pub struct DialerSession {
    inner: Arc<Inner>,
    dialer: AutoDialer,
    completion_task: JoinHandle<()>,
}

impl DialerSession {
    pub fn new(config: SessionConfig, events: Arc<dyn EventSink>, registry: Arc<dyn NumberRegistry>) -> Self {
        Self::with_clock(config, events, registry, Arc::new(SystemClock), PollIntervals::default())
    }

    pub fn with_clock(
        config: SessionConfig,
        events: Arc<dyn EventSink>,
        registry: Arc<dyn NumberRegistry>,
        clock: Arc<dyn Clock>,
        polls: PollIntervals,
    ) -> Self {
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let rtp_ports = RtpPortAllocator::new(config.rtp_base_port, config.rtp_port_count);
        let inner = Arc::new(Inner {
            config,
            events,
            registry: registry.clone(),
            connection: RwLock::new(None),
            calls: RwLock::new(HashMap::new()),
            rtp_ports,
            completions,
        });

        let completion_task = tokio::spawn(completion_loop(Arc::downgrade(&inner), completion_rx));
        let dialer = AutoDialer::with_polls(inner.clone(), registry, clock, polls);

        Self {
            inner,
            dialer,
            completion_task,
        }
    }

    /// Resolve the server, bind UDP and start registering.
    /// The outcome arrives as a `Registered`/`RegistrationFailed` event.
    pub async fn register(&self, credentials: Credentials) -> Result<()> {
        self.check_not_registering().await?;

        let server = (credentials.sip_server.as_str(), credentials.port);
        let remote = tokio::net::lookup_host(server)
            .await
            .map_err(|e| DialerError::Transport(format!("Cannot resolve {}: {}", credentials.sip_server, e)))?
            .next()
            .ok_or_else(|| DialerError::Transport(format!("No address for {}", credentials.sip_server)))?;

        let bind = SocketAddr::new(self.inner.config.bind_address, self.inner.config.local_port);
        let (transport, inbound) = UdpTransport::bind(bind, remote, self.inner.config.advertised_ip)
            .await
            .map_err(|e| DialerError::Transport(e.to_string()))?;

        self.register_with_transport(credentials, transport, inbound).await
    }

    /// Start registering over an already-bound transport
    pub async fn register_with_transport(
        &self,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<IncomingMessage>,
    ) -> Result<()> {
        self.check_not_registering().await?;
        self.disconnect().await;

        let (layer, requests) = TransactionLayer::new(transport, inbound, self.inner.config.transaction);
        let credentials = Arc::new(credentials);
        let registration = Registration::spawn(
            layer.clone(),
            credentials.clone(),
            self.inner.config.registration,
            self.inner.events.clone(),
        );
        let inbound = tokio::spawn(request_loop(Arc::downgrade(&self.inner), layer.clone(), requests));

        *self.inner.connection.write().await = Some(Connection {
            layer,
            credentials,
            registration,
            inbound,
        });
        Ok(())
    }

    async fn check_not_registering(&self) -> Result<()> {
        match self.registration_state().await {
            Some(RegistrationState::Registering) => Err(DialerError::RegistrationInProgress),
            _ => Ok(()),
        }
    }

    pub async fn registration_state(&self) -> Option<RegistrationState> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .map(|c| c.registration.state())
    }

    /// Wait for the current registration attempt to resolve
    pub async fn registration_settled(&self) -> Option<RegistrationState> {
        let connection = self.inner.connection.read().await;
        match connection.as_ref() {
            Some(c) => Some(c.registration.settled().await),
            None => None,
        }
    }

    pub async fn is_registered(&self) -> bool {
        self.registration_state().await == Some(RegistrationState::Registered)
    }

    /// Dial `number`; the auto-hangup bounds come from the global config
    pub async fn place_call(&self, number: &str, label: &str) -> Result<CallAttemptId> {
        self.inner
            .place(NumberEntry::new(number).with_label(label), None)
            .await
    }

    pub async fn hangup(&self, call_id: CallAttemptId) -> Result<()> {
        let calls = self.inner.calls.read().await;
        let handle = calls.get(&call_id).ok_or(DialerError::UnknownCall(call_id))?;
        info!("Hangup requested for call {}", call_id);
        handle.hangup().await;
        Ok(())
    }

    pub async fn hangup_all(&self) {
        let calls = self.inner.calls.read().await;
        for handle in calls.values() {
            handle.hangup().await;
        }
    }

    pub async fn active_call_count(&self) -> usize {
        self.inner.active_call_count().await
    }

    pub async fn active_calls(&self) -> Vec<ActiveCall> {
        let calls = self.inner.calls.read().await;
        calls
            .values()
            .filter(|c| c.is_active())
            .map(|c| ActiveCall {
                call_id: c.id(),
                number: c.number().to_string(),
                label: c.label().to_string(),
                state: c.state().name(),
                remaining_seconds: c.remaining_seconds(),
            })
            .collect()
    }

    /// Seconds until the call's auto-hangup, `None` when no timer is armed
    pub async fn remaining_seconds(&self, call_id: CallAttemptId) -> Result<Option<u64>> {
        let calls = self.inner.calls.read().await;
        calls
            .get(&call_id)
            .map(|c| c.remaining_seconds())
            .ok_or(DialerError::UnknownCall(call_id))
    }

    pub async fn start_auto_dialer(&self, settings: SchedulerSettings) -> Result<()> {
        if !self.is_registered().await {
            return Err(DialerError::NotRegistered);
        }
        self.dialer.start(settings)
    }

    pub async fn stop_auto_dialer(&self) {
        self.dialer.stop().await;
    }

    pub fn is_auto_dialer_running(&self) -> bool {
        self.dialer.is_running()
    }

    pub fn auto_dialer_status(&self) -> watch::Receiver<DialerStatus> {
        self.dialer.status()
    }

    pub fn registry(&self) -> Arc<dyn NumberRegistry> {
        self.inner.registry.clone()
    }

    /// Stop dialing, release every call and unregister
    pub async fn shutdown(&self) {
        info!("Shutting down dialer session");
        self.dialer.stop().await;
        self.disconnect().await;
    }

    async fn disconnect(&self) {
        self.hangup_all().await;
        {
            let calls = self.inner.calls.read().await;
            // Each BYE is bounded by the transaction timeout
            let limit = self.inner.config.transaction.timeout + Duration::from_secs(1);
            if timeout(limit, join_all(calls.values().map(|c| c.finished()))).await.is_err() {
                warn!("Calls still active after {:?}, abandoning them", limit);
            }
        }
        self.inner.calls.write().await.clear();

        let connection = self.inner.connection.write().await.take();
        if let Some(connection) = connection {
            if connection.registration.is_registered() {
                connection.registration.unregister().await;
            }
            connection.inbound.abort();
            connection.layer.stop();
        }
    }
}

impl Drop for DialerSession {
    fn drop(&mut self) {
        self.completion_task.abort();
    }
}

impl Inner {
    async fn place(&self, entry: NumberEntry, duration_override: Option<(u64, u64)>) -> Result<CallAttemptId> {
        let (layer, credentials) = {
            let connection = self.connection.read().await;
            match connection.as_ref() {
                Some(c) if c.registration.is_registered() => (c.layer.clone(), c.credentials.clone()),
                _ => return Err(DialerError::NotRegistered),
            }
        };

        let number = normalize_number(&entry.number);
        if number.is_empty() {
            return Err(DialerError::InvalidNumber(entry.number));
        }

        let auto_hangup = self.config.auto_hangup.enabled.then(|| match duration_override {
            Some(bounds) => bounds,
            None => self
                .config
                .auto_hangup
                .bounds_for(entry.min_duration_seconds, entry.max_duration_seconds),
        });

        let id = CallAttemptId::new();
        self.registry.record_attempt_started(&number).await;
        self.events.emit(DialerEvent::CallStarted {
            call_id: id,
            number: number.clone(),
            label: entry.label.clone(),
        });

        let params = CallParams {
            id,
            number,
            label: entry.label,
            auto_hangup,
            rtp_port: self.rtp_ports.allocate(),
        };
        let handle = Call::spawn(params, layer, credentials, self.events.clone(), self.completions.clone());
        self.calls.write().await.insert(id, handle);
        Ok(id)
    }

    async fn finish(&self, summary: CallSummary) {
        match summary.talk_duration {
            Some(talk) => {
                self.registry
                    .record_attempt_connected(&summary.number, talk.as_secs())
                    .await
            }
            None => {
                let detail = summary
                    .failure
                    .unwrap_or_else(|| format!("ended in state {}", summary.state.name()));
                self.registry.record_attempt_failed(&summary.number, &detail).await
            }
        }
        self.calls.write().await.remove(&summary.id);
    }
}

#[async_trait::async_trait]
impl CallLauncher for Inner {
    async fn active_call_count(&self) -> usize {
        self.calls.read().await.values().filter(|c| c.is_active()).count()
    }

    async fn launch(&self, entry: NumberEntry, duration_override: Option<(u64, u64)>) -> Result<CallAttemptId> {
        self.place(entry, duration_override).await
    }
}

async fn completion_loop(inner: Weak<Inner>, mut completions: mpsc::UnboundedReceiver<CallSummary>) {
    while let Some(summary) = completions.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        debug!("Recording outcome of call {}", summary.id);
        inner.finish(summary).await;
    }
}

/// Answer requests from the server that no client transaction claims
async fn request_loop(inner: Weak<Inner>, layer: Arc<TransactionLayer>, mut requests: mpsc::Receiver<SipRequest>) {
    while let Some(request) = requests.recv().await {
        let response = match request.method {
            SipMethod::Ack => {
                debug!("Ignoring stray ACK");
                continue;
            }
            SipMethod::Options => ResponseBuilder::ok(),
            SipMethod::Bye => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if route_bye(&inner, &request).await {
                    continue;
                }
                warn!("BYE for unknown dialog {}", request.call_id().unwrap_or("-"));
                ResponseBuilder::call_does_not_exist()
            }
            other => {
                debug!("Rejecting unsupported inbound {}", other);
                ResponseBuilder::not_implemented()
            }
        };

        if let Err(e) = layer.send_response(&response.build_for_request(&request)).await {
            warn!("Failed to answer inbound {}: {}", request.method, e);
        }
    }
    debug!("Inbound request loop exiting");
}

async fn route_bye(inner: &Inner, request: &SipRequest) -> bool {
    let Some(call_id) = request.call_id() else {
        return false;
    };
    let calls = inner.calls.read().await;
    match calls.values().find(|c| c.sip_call_id() == call_id && c.is_active()) {
        Some(handle) => handle.remote_bye(request.clone()).await,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::number_registry::InMemoryNumberRegistry;
    use crate::domain::shared::events::MockEventSink;

    fn session() -> DialerSession {
        let mut events = MockEventSink::new();
        events.expect_emit().never();
        DialerSession::new(
            SessionConfig::default(),
            Arc::new(events),
            Arc::new(InMemoryNumberRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_call_requires_registration() {
        let session = session();
        assert_eq!(session.registration_state().await, None);
        assert_eq!(
            session.place_call("100", "").await,
            Err(DialerError::NotRegistered)
        );
        assert_eq!(session.active_call_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_call() {
        let session = session();
        let id = CallAttemptId::new();
        assert_eq!(session.hangup(id).await, Err(DialerError::UnknownCall(id)));
        assert_eq!(session.remaining_seconds(id).await, Err(DialerError::UnknownCall(id)));
    }

    #[tokio::test]
    async fn test_auto_dialer_requires_registration() {
        let session = session();
        let settings = SchedulerSettings {
            pool: vec![NumberEntry::new("100")],
            concurrency_cap: 1,
            min_interval_seconds: 1,
            max_interval_seconds: 2,
            working_hours: Default::default(),
            duration_override: None,
        };
        assert_eq!(
            session.start_auto_dialer(settings).await,
            Err(DialerError::NotRegistered)
        );
        assert!(!session.is_auto_dialer_running());
        session.shutdown().await;
    }

    #[test]
    fn test_session_config_from_config() {
        let mut config = Config::default();
        config.sip.bind_address = "not an ip".to_string();
        config.sip.local_port = 5099;
        let session_config = SessionConfig::from_config(&config);
        assert_eq!(session_config.bind_address, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(session_config.local_port, 5099);
        assert_eq!(session_config.registration.expires, 3600);
    }
}
