//! Scripted SIP server over the in-memory channel transport

#![allow(dead_code)]

use sipdialer::application::session::{DialerSession, SessionConfig};
use sipdialer::domain::auto_dialer::{Clock, PollIntervals};
use sipdialer::domain::number_registry::InMemoryNumberRegistry;
use sipdialer::domain::shared::{Credentials, DialerEvent};
use sipdialer::infrastructure::protocols::sip::{
    ChannelPeer, ChannelTransport, IncomingMessage, NameAddr, ResponseBuilder, SipMessage, SipMethod,
    SipRequest, SipResponse, TransactionConfig,
};
use chrono::NaiveTime;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

pub const LOCAL: &str = "192.0.2.10:5070";
pub const SERVER: &str = "192.0.2.1:5060";

pub const SDP_ANSWER: &str = "v=0\r\n\
o=- 42 42 IN IP4 192.0.2.1\r\n\
s=-\r\n\
c=IN IP4 192.0.2.1\r\n\
t=0 0\r\n\
m=audio 30000 RTP/AVP 0 101\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n";

const WAIT: Duration = Duration::from_secs(60);

pub fn credentials() -> Credentials {
    Credentials {
        username: "alice".to_string(),
        password: "secret".to_string(),
        realm: None,
        sip_server: "example.com".to_string(),
        port: 5060,
    }
}

pub fn channel() -> (Arc<ChannelTransport>, mpsc::Receiver<IncomingMessage>, ChannelPeer) {
    let local: SocketAddr = LOCAL.parse().unwrap();
    let remote: SocketAddr = SERVER.parse().unwrap();
    ChannelTransport::pair(local, remote)
}

/// One send per request so tests see every message exactly once
pub fn quiet_transactions() -> TransactionConfig {
    TransactionConfig {
        retransmit: false,
        ..TransactionConfig::default()
    }
}

pub fn session_config(auto_hangup: Option<(u64, u64)>) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.transaction = quiet_transactions();
    match auto_hangup {
        Some((min, max)) => {
            config.auto_hangup.enabled = true;
            config.auto_hangup.min_seconds = min;
            config.auto_hangup.max_seconds = max;
        }
        None => config.auto_hangup.enabled = false,
    }
    config
}

pub struct FixedClock(pub NaiveTime);

impl Clock for FixedClock {
    fn local_time(&self) -> NaiveTime {
        self.0
    }
}

pub fn noon() -> Arc<FixedClock> {
    Arc::new(FixedClock(NaiveTime::from_hms_opt(12, 0, 0).unwrap()))
}

pub struct FakeServer {
    pub peer: ChannelPeer,
}

impl FakeServer {
    pub fn new(peer: ChannelPeer) -> Self {
        Self { peer }
    }

    pub async fn next_message(&mut self) -> SipMessage {
        timeout(WAIT, self.peer.recv())
            .await
            .expect("timed out waiting for the stack")
            .expect("stack transport closed")
    }

    pub async fn expect_request(&mut self, method: SipMethod) -> SipRequest {
        match self.next_message().await {
            SipMessage::Request(request) => {
                assert_eq!(request.method, method, "unexpected request {:?}", request);
                request
            }
            SipMessage::Response(response) => panic!("expected {}, got response {:?}", method, response),
        }
    }

    pub async fn expect_response(&mut self) -> SipResponse {
        match self.next_message().await {
            SipMessage::Response(response) => response,
            SipMessage::Request(request) => panic!("expected a response, got {:?}", request),
        }
    }

    pub fn assert_silent(&mut self) {
        if let Some(message) = self.peer.try_recv() {
            panic!("unexpected message {:?}", message);
        }
    }

    pub async fn reply(&self, request: &SipRequest, builder: ResponseBuilder) -> SipResponse {
        let response = builder.build_for_request(request);
        self.peer.send(&SipMessage::Response(response.clone())).await;
        response
    }

    pub async fn challenge(&self, request: &SipRequest, status: u16, challenge: &str) {
        let header = if status == 407 {
            "Proxy-Authenticate"
        } else {
            "WWW-Authenticate"
        };
        self.reply(request, ResponseBuilder::new(status).header(header, challenge))
            .await;
    }

    /// Accept a REGISTER with the requested expiry
    pub async fn accept_register(&mut self) -> SipRequest {
        let request = self.expect_request(SipMethod::Register).await;
        self.reply(&request, ResponseBuilder::ok()).await;
        request
    }

    /// Answer an INVITE with 200 and SDP; returns the 200
    pub async fn answer(&self, invite: &SipRequest) -> SipResponse {
        self.reply(
            invite,
            ResponseBuilder::ok()
                .header("Contact", format!("<sip:callee@{}>", SERVER))
                .header("Content-Type", "application/sdp")
                .body(SDP_ANSWER),
        )
        .await
    }

    /// Answer an INVITE and consume the ACK
    pub async fn answer_and_ack(&mut self, invite: &SipRequest) -> (SipResponse, SipRequest) {
        let ok = self.answer(invite).await;
        let ack = self.expect_request(SipMethod::Ack).await;
        (ok, ack)
    }

    /// In-dialog BYE from the callee side of an answered INVITE
    pub async fn send_bye(&self, ok: &SipResponse) -> SipRequest {
        let from = ok.headers.get("to").unwrap().to_string();
        let to = ok.headers.get("from").unwrap().to_string();
        let mut bye = SipRequest::new(SipMethod::Bye, format!("sip:alice@{}", LOCAL));
        bye.headers.push("Via", format!("SIP/2.0/UDP {};branch=z9hG4bKserverbye", SERVER));
        bye.headers.push("From", from);
        bye.headers.push("To", to);
        bye.headers.push("Call-ID", ok.call_id().unwrap());
        bye.headers.push("CSeq", "1 BYE");
        self.peer.send(&SipMessage::Request(bye.clone())).await;
        bye
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<DialerEvent>) -> DialerEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

pub struct Harness {
    pub session: DialerSession,
    pub server: FakeServer,
    pub events: mpsc::UnboundedReceiver<DialerEvent>,
    pub registry: Arc<InMemoryNumberRegistry>,
}

impl Harness {
    pub async fn registered(config: SessionConfig) -> Self {
        Self::registered_with(config, Arc::new(InMemoryNumberRegistry::new())).await
    }

    pub async fn registered_with(config: SessionConfig, registry: Arc<InMemoryNumberRegistry>) -> Self {
        Self::registered_at(config, registry, noon()).await
    }

    pub async fn registered_at(
        config: SessionConfig,
        registry: Arc<InMemoryNumberRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let session = DialerSession::with_clock(
            config,
            Arc::new(event_tx),
            registry.clone(),
            clock,
            PollIntervals::default(),
        );
        let (transport, inbound, peer) = channel();
        session
            .register_with_transport(credentials(), transport, inbound)
            .await
            .unwrap();

        let mut harness = Self {
            session,
            server: FakeServer::new(peer),
            events,
            registry,
        };
        harness.server.accept_register().await;
        assert_eq!(harness.next_event().await, DialerEvent::Registered);
        harness
    }

    pub async fn next_event(&mut self) -> DialerEvent {
        next_event(&mut self.events).await
    }

    /// Wait until the session has recorded every finished call
    pub async fn settle_calls(&self) {
        for _ in 0..100 {
            if self.session.active_calls().await.is_empty() {
                // let the completion loop record the outcome
                tokio::time::sleep(Duration::from_millis(50)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("calls did not finish");
    }
}

pub fn to_tag(response: &SipResponse) -> Option<String> {
    response
        .headers
        .get("to")
        .and_then(|v| v.parse::<NameAddr>().ok())
        .and_then(|to| to.tag().map(str::to_string))
}
