//! SIP transport layer - UDP towards a single SIP server, plus an in-process
//! channel transport used to drive the stack without sockets

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const INBOUND_QUEUE: usize = 1000;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Channel,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            // Advertised as UDP on the wire so Via headers stay valid
            TransportProtocol::Channel => "UDP",
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a serialized message to the SIP server
    async fn send(&self, data: Bytes) -> Result<(), SipError>;

    /// Address advertised in Via and Contact headers
    fn local_addr(&self) -> SocketAddr;

    fn protocol(&self) -> TransportProtocol;

    /// Stop receiving; later sends fail
    fn close(&self);
}

/// Parse a datagram and forward it; unparseable input is dropped
async fn deliver(data: &[u8], source: SocketAddr, tx: &mpsc::Sender<IncomingMessage>) -> bool {
    match SipMessage::parse(data) {
        Ok(message) => tx.send(IncomingMessage { message, source }).await.is_ok(),
        Err(e) => {
            warn!("Failed to parse SIP message from {}: {}", source, e);
            true
        }
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    advertised: SocketAddr,
    closed: AtomicBool,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind the local socket and start the receive loop.
    ///
    /// `advertised_ip` overrides the address written into Via/Contact; when
    /// absent the address of the interface routing to `remote` is used.
    pub async fn bind(
        bind_addr: SocketAddr,
        remote: SocketAddr,
        advertised_ip: Option<std::net::IpAddr>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IncomingMessage>), SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(format!("Failed to read local address: {}", e)))?;

        let ip = match advertised_ip {
            Some(ip) => ip,
            None => Self::route_ip(remote).await.unwrap_or(local.ip()),
        };
        let advertised = SocketAddr::new(ip, local.port());
        info!(
            "UDP transport listening on {} (advertised {}), server {}",
            local, advertised, remote
        );

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let receive_task = tokio::spawn(Self::receive_loop(socket.clone(), tx));

        Ok((
            Arc::new(Self {
                socket,
                remote,
                advertised,
                closed: AtomicBool::new(false),
                receive_task: Mutex::new(Some(receive_task)),
            }),
            rx,
        ))
    }

    /// Local interface address used to reach `remote`
    async fn route_ip(remote: SocketAddr) -> Option<std::net::IpAddr> {
        let any: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let probe = UdpSocket::bind(any).await.ok()?;
        probe.connect(remote).await.ok()?;
        probe.local_addr().ok().map(|a| a.ip())
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    if !deliver(&buf[..size], source, &tx).await {
                        debug!("Inbound channel closed, stopping UDP receive loop");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: Bytes) -> Result<(), SipError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SipError::TransportError("Transport closed".to_string()));
        }

        debug!("Sending {} bytes to {} via UDP", data.len(), self.remote);

        self.socket
            .send_to(&data, self.remote)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.advertised
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Stopping UDP transport");
            if let Ok(mut task) = self.receive_task.lock() {
                if let Some(handle) = task.take() {
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-process datagram transport.
///
/// Everything the stack sends shows up on the [`ChannelPeer`]; bytes the
/// peer injects go through the codec exactly like received datagrams.
pub struct ChannelTransport {
    local: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
    fail_sends: Arc<AtomicBool>,
}

/// Remote end of a [`ChannelTransport`]
pub struct ChannelPeer {
    pub remote: SocketAddr,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    inbound: mpsc::Sender<IncomingMessage>,
    fail_sends: Arc<AtomicBool>,
}

impl ChannelTransport {
    pub fn pair(
        local: SocketAddr,
        remote: SocketAddr,
    ) -> (Arc<Self>, mpsc::Receiver<IncomingMessage>, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let fail_sends = Arc::new(AtomicBool::new(false));

        let transport = Arc::new(Self {
            local,
            outbound: out_tx,
            closed: AtomicBool::new(false),
            fail_sends: fail_sends.clone(),
        });
        let peer = ChannelPeer {
            remote,
            outbound: out_rx,
            inbound: in_tx,
            fail_sends,
        };
        (transport, in_rx, peer)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, data: Bytes) -> Result<(), SipError> {
        if self.closed.load(Ordering::Acquire) || self.fail_sends.load(Ordering::Acquire) {
            return Err(SipError::TransportError("Channel transport unavailable".to_string()));
        }
        self.outbound
            .send(data)
            .map_err(|_| SipError::TransportError("Channel peer dropped".to_string()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Channel
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl ChannelPeer {
    /// Next message the stack sent, parsed
    pub async fn recv(&mut self) -> Option<SipMessage> {
        let data = self.outbound.recv().await?;
        SipMessage::parse(&data).ok()
    }

    /// Non-blocking variant of [`ChannelPeer::recv`]
    pub fn try_recv(&mut self) -> Option<SipMessage> {
        let data = self.outbound.try_recv().ok()?;
        SipMessage::parse(&data).ok()
    }

    /// Feed raw bytes to the stack as if received from the network
    pub async fn inject(&self, data: &[u8]) {
        deliver(data, self.remote, &self.inbound).await;
    }

    pub async fn send(&self, message: &SipMessage) {
        self.inject(&message.to_bytes()).await;
    }

    /// Make every following send of the stack fail with a transport error
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::{SipMethod, SipRequest};

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "10.0.0.1:5070".parse().unwrap(),
            "10.0.0.2:5060".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (local, remote) = addrs();
        let (transport, mut inbound, mut peer) = ChannelTransport::pair(local, remote);

        let mut req = SipRequest::new(SipMethod::Options, "sip:example.com");
        req.headers.push("Call-ID", "abc");
        req.headers.push("CSeq", "1 OPTIONS");
        transport.send(req.to_bytes()).await.unwrap();

        let sent = peer.recv().await.unwrap();
        assert_eq!(sent.as_request().unwrap().method, SipMethod::Options);

        peer.inject(b"SIP/2.0 200 OK\r\nCall-ID: abc\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n")
            .await;
        let incoming = inbound.recv().await.unwrap();
        assert_eq!(incoming.source, remote);
        assert!(incoming.message.is_response());
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let (local, remote) = addrs();
        let (_transport, mut inbound, peer) = ChannelTransport::pair(local, remote);

        peer.inject(b"not a sip message").await;
        peer.inject(b"SIP/2.0 200 OK\r\nContent-Length: 99\r\n\r\n").await;
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_failure() {
        let (local, remote) = addrs();
        let (transport, _inbound, peer) = ChannelTransport::pair(local, remote);

        peer.fail_sends(true);
        let err = transport.send(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, SipError::TransportError(_)));

        peer.fail_sends(false);
        transport.close();
        assert!(transport.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_udp_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let (transport, mut inbound) = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_addr,
            None,
        )
        .await
        .unwrap();
        assert_eq!(transport.local_addr().ip().to_string(), "127.0.0.1");

        transport.send(Bytes::from_static(b"ping")).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server
            .send_to(b"SIP/2.0 200 OK\r\nCall-ID: u\r\nCSeq: 1 OPTIONS\r\n\r\n", from)
            .await
            .unwrap();
        let incoming = inbound.recv().await.unwrap();
        assert_eq!(incoming.message.headers().call_id(), Some("u"));

        transport.close();
    }
}
