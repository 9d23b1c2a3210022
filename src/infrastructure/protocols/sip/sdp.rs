//! Simple SDP (Session Description Protocol) handling
//!
//! Only the offer/answer parameters are handled; no media is processed.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};

/// Simple SDP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl SdpConnection {
    fn for_ip(ip: IpAddr) -> Self {
        Self {
            network_type: "IN".to_string(),
            address_type: if ip.is_ipv4() { "IP4" } else { "IP6" }.to_string(),
            address: ip.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    pub media_type: String,  // "audio", "video"
    pub port: u16,
    pub protocol: String,    // "RTP/AVP"
    pub formats: Vec<String>, // Codec payload types
    pub rtpmap: Vec<(String, String)>, // (payload_type, encoding)
    pub connection: Option<SdpConnection>,
    pub direction: Option<String>,
}

impl SdpSession {
    /// Audio offer: PCMU, PCMA and telephone-event on `local_port`
    pub fn create_offer(local_ip: IpAddr, local_port: u16) -> Self {
        let now = chrono::Utc::now().timestamp().to_string();
        let connection = SdpConnection::for_ip(local_ip);
        Self {
            version: 0,
            origin: SdpOrigin {
                username: "-".to_string(),
                session_id: now.clone(),
                session_version: now,
                network_type: connection.network_type.clone(),
                address_type: connection.address_type.clone(),
                address: connection.address.clone(),
            },
            session_name: "SIP Call".to_string(),
            connection: Some(connection),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: vec!["0".to_string(), "8".to_string(), "101".to_string()],
                rtpmap: vec![
                    ("0".to_string(), "PCMU/8000".to_string()),
                    ("8".to_string(), "PCMA/8000".to_string()),
                    ("101".to_string(), "telephone-event/8000".to_string()),
                ],
                connection: None,
                direction: Some("sendrecv".to_string()),
            }],
        }
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (Some(field_type), Some(value)) = (line.get(..2), line.get(2..)) else {
                continue;
            };
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().unwrap_or(0);
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            network_type: parts[3].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let conn = SdpConnection {
                            network_type: parts[0].to_string(),
                            address_type: parts[1].to_string(),
                            // Strip a multicast TTL suffix
                            address: parts[2].split('/').next().unwrap_or(parts[2]).to_string(),
                        };
                        match current_media.as_mut() {
                            Some(m) => m.connection = Some(conn),
                            None => connection = Some(conn),
                        }
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].split('/').next().and_then(|p| p.parse().ok()).unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            connection: None,
                            direction: None,
                        });
                    }
                }
                "a=" => {
                    if let Some(media) = current_media.as_mut() {
                        if let Some(rtpmap_value) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, encoding)) = rtpmap_value.split_once(' ') {
                                media.rtpmap.push((pt.to_string(), encoding.to_string()));
                            }
                        } else if matches!(value, "sendrecv" | "sendonly" | "recvonly" | "inactive") {
                            media.direction = Some(value.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Payload types offered on the audio stream
    pub fn audio_codecs(&self) -> Vec<u8> {
        self.audio_media()
            .map(|audio| {
                audio
                    .formats
                    .iter()
                    .filter_map(|f| f.parse::<u8>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remote RTP address and port of the audio stream.
    /// Media-level `c=` wins over the session-level one.
    pub fn audio_endpoint(&self) -> Option<(String, u16)> {
        let audio = self.audio_media()?;
        let connection = audio.connection.as_ref().or(self.connection.as_ref())?;
        Some((connection.address.clone(), audio.port))
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(f, "c={} {} {}\r\n", c.network_type, c.address_type, c.address)?;
        }
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            if let Some(c) = &media.connection {
                write!(f, "c={} {} {}\r\n", c.network_type, c.address_type, c.address)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            if let Some(direction) = &media.direction {
                write!(f, "a={}\r\n", direction)?;
            }
        }
        Ok(())
    }
}

/// Hands out even RTP ports from `base`, wrapping after `count` ports
#[derive(Debug)]
pub struct RtpPortAllocator {
    base: u16,
    count: u16,
    next: AtomicU16,
}

impl RtpPortAllocator {
    pub fn new(base: u16, count: u16) -> Self {
        Self {
            base: base & !1,
            count: count.max(1),
            next: AtomicU16::new(0),
        }
    }

    pub fn allocate(&self) -> u16 {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.count;
        self.base.wrapping_add(slot.wrapping_mul(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_offer() {
        let local_ip: IpAddr = "192.168.1.100".parse().unwrap();
        let sdp = SdpSession::create_offer(local_ip, 10000);

        let sdp_str = sdp.to_string();
        assert!(sdp_str.starts_with("v=0\r\no=- "));
        assert!(sdp_str.contains("s=SIP Call\r\n"));
        assert!(sdp_str.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp_str.contains("m=audio 10000 RTP/AVP 0 8 101\r\n"));
        assert!(sdp_str.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(sdp_str.contains("a=rtpmap:8 PCMA/8000\r\n"));
        assert!(sdp_str.contains("a=rtpmap:101 telephone-event/8000\r\n"));
        assert!(sdp_str.ends_with("a=sendrecv\r\n"));
    }

    #[test]
    fn test_parse_sdp() {
        let sdp_str = r#"v=0
o=user1 123456 7890 IN IP4 192.168.1.100
s=Test Session
c=IN IP4 192.168.1.100
t=0 0
m=audio 10000 RTP/AVP 0 8
a=rtpmap:0 PCMU/8000
a=rtpmap:8 PCMA/8000
a=sendonly
"#;

        let sdp = SdpSession::parse(sdp_str).unwrap();
        assert_eq!(sdp.version, 0);
        assert_eq!(sdp.session_name, "Test Session");
        assert_eq!(sdp.origin.username, "user1");
        assert_eq!(sdp.connection.as_ref().unwrap().address, "192.168.1.100");

        let audio = sdp.audio_media().unwrap();
        assert_eq!(audio.port, 10000);
        assert_eq!(audio.formats, vec!["0", "8"]);
        assert_eq!(audio.rtpmap.len(), 2);
        assert_eq!(audio.direction.as_deref(), Some("sendonly"));
        assert_eq!(sdp.audio_codecs(), vec![0, 8]);
        assert_eq!(sdp.audio_endpoint(), Some(("192.168.1.100".to_string(), 10000)));
    }

    #[test]
    fn test_media_level_connection_wins() {
        let sdp_str = "v=0\r\no=- 1 1 IN IP4 10.0.0.9\r\ns=-\r\nc=IN IP4 10.0.0.9\r\nt=0 0\r\n\
                       m=audio 4000 RTP/AVP 8\r\nc=IN IP4 10.0.0.10\r\n";
        let sdp = SdpSession::parse(sdp_str).unwrap();
        assert_eq!(sdp.audio_endpoint(), Some(("10.0.0.10".to_string(), 4000)));
    }

    #[test]
    fn test_parse_generate_roundtrip() {
        let local_ip: IpAddr = "10.0.0.5".parse().unwrap();
        let original = SdpSession::create_offer(local_ip, 20000);
        let parsed = SdpSession::parse(&original.to_string()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_parse_rejects_missing_origin() {
        assert!(SdpSession::parse("v=0\r\ns=x\r\n").is_none());
        assert!(SdpSession::parse("").is_none());
    }

    #[test]
    fn test_rtp_port_allocator() {
        let allocator = RtpPortAllocator::new(10001, 3);
        assert_eq!(allocator.allocate(), 10000);
        assert_eq!(allocator.allocate(), 10002);
        assert_eq!(allocator.allocate(), 10004);
        assert_eq!(allocator.allocate(), 10000);
    }
}
