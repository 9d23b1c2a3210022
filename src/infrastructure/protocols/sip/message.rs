//! SIP message types, parsing and serialization
//!
//! The codec is a pure transform between wire bytes and [`SipMessage`]:
//! - folded (continuation) header lines are rejected
//! - the body length must match `Content-Length`
//! - serialization emits the mandatory headers in a fixed order
//!
//! `Content-Length` is never stored in [`Headers`]; it is validated on parse
//! and recomputed from the body on serialize.

use super::auth::AuthError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthError),
}

/// Errors raised at the codec boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("body length {actual} does not match Content-Length {declared}")]
    LengthMismatch { declared: usize, actual: usize },
}

impl ParseError {
    fn malformed(reason: impl Into<String>) -> Self {
        ParseError::Malformed(reason.into())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Notify,
    Message,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Message => "MESSAGE",
        }
    }
}

impl FromStr for SipMethod {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "CANCEL" => Ok(SipMethod::Cancel),
            "BYE" => Ok(SipMethod::Bye),
            "OPTIONS" => Ok(SipMethod::Options),
            "INFO" => Ok(SipMethod::Info),
            "NOTIFY" => Ok(SipMethod::Notify),
            "MESSAGE" => Ok(SipMethod::Message),
            other => Err(ParseError::malformed(format!("unsupported method {}", other))),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Header names in the order they are written on the wire.
/// Everything else follows in insertion order.
const ORDERED_HEADERS: [&str; 7] = [
    "via",
    "from",
    "to",
    "call-id",
    "cseq",
    "contact",
    "content-type",
];

fn expand_compact_name(name: &str) -> &str {
    match name {
        "v" => "via",
        "f" => "from",
        "t" => "to",
        "i" => "call-id",
        "m" => "contact",
        "c" => "content-type",
        "l" => "content-length",
        other => other,
    }
}

fn wire_name(name: &str) -> String {
    match name {
        "via" => "Via".to_string(),
        "from" => "From".to_string(),
        "to" => "To".to_string(),
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "contact" => "Contact".to_string(),
        "content-type" => "Content-Type".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        other => other
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

/// Header map keyed by lower-cased name, one entry per value
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping existing values for the same name
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Replace every value of `name` with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || *n != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in wire order: mandatory headers first, then extensions
    pub fn ordered(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::with_capacity(self.entries.len());
        for name in ORDERED_HEADERS {
            out.extend(
                self.entries
                    .iter()
                    .filter(|(n, _)| n == name)
                    .map(|(n, v)| (n.as_str(), v.as_str())),
            );
        }
        out.extend(
            self.entries
                .iter()
                .filter(|(n, _)| !ORDERED_HEADERS.contains(&n.as_str()))
                .map(|(n, v)| (n.as_str(), v.as_str())),
        );
        out
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("call-id")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.get("cseq").and_then(|v| v.parse().ok())
    }

    pub fn from_addr(&self) -> Option<NameAddr> {
        self.get("from").and_then(|v| v.parse().ok())
    }

    pub fn to_addr(&self) -> Option<NameAddr> {
        self.get("to").and_then(|v| v.parse().ok())
    }

    pub fn contact(&self) -> Option<NameAddr> {
        self.get("contact").and_then(|v| v.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    pub fn expires(&self) -> Option<u32> {
        self.get("expires").and_then(|v| v.trim().parse().ok())
    }

    /// Branch parameter of the topmost Via
    pub fn via_branch(&self) -> Option<&str> {
        self.get("via").and_then(|via| {
            via.split(';')
                .map(str::trim)
                .find_map(|p| p.strip_prefix("branch="))
        })
    }
}

// Header order only matters on the wire, so equality compares wire order.
impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.ordered() == other.ordered()
    }
}

impl Eq for Headers {}

/// CSeq header value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub seq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(seq: u32, method: SipMethod) -> Self {
        Self { seq, method }
    }
}

impl FromStr for CSeq {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let seq = parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ParseError::malformed(format!("invalid CSeq: {}", s)))?;
        let method = parts
            .next()
            .ok_or_else(|| ParseError::malformed(format!("CSeq without method: {}", s)))?
            .parse()?;
        Ok(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// `From`/`To`/`Contact` value: optional display name, URI and parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: String,
    pub params: Vec<(String, Option<String>)>,
}

impl NameAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            display_name: None,
            uri: uri.into(),
            params: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.set_param("tag", Some(tag.into()));
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.param("tag")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        match self.params.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
    }
}

impl FromStr for NameAddr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (display_name, uri, rest) = if let Some(open) = s.find('<') {
            let close = s[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| ParseError::malformed(format!("unterminated address: {}", s)))?;
            let display = s[..open].trim().trim_matches('"').trim();
            let display = (!display.is_empty()).then(|| display.to_string());
            (display, s[open + 1..close].to_string(), &s[close + 1..])
        } else {
            // addr-spec form: parameters after ';' belong to the header
            match s.find(';') {
                Some(semi) => (None, s[..semi].to_string(), &s[semi..]),
                None => (None, s.to_string(), ""),
            }
        };

        if uri.is_empty() {
            return Err(ParseError::malformed("empty URI"));
        }

        let params = rest
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        Ok(Self {
            display_name,
            uri,
            params,
        })
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// SIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        match SipMessage::parse(data)? {
            SipMessage::Request(request) => Ok(request),
            SipMessage::Response(_) => Err(SipError::InvalidMessage(
                "expected a request, got a response".to_string(),
            )),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.cseq()
    }

    pub fn to_bytes(&self) -> Bytes {
        serialize_parts(
            &format!("{} {} SIP/2.0", self.method, self.uri),
            &self.headers,
            &self.body,
        )
    }
}

/// SIP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl SipResponse {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        match SipMessage::parse(data)? {
            SipMessage::Response(response) => Ok(response),
            SipMessage::Request(_) => Err(SipError::InvalidMessage(
                "expected a response, got a request".to_string(),
            )),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_auth_challenge(&self) -> bool {
        matches!(self.status_code, 401 | 407)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn cseq(&self) -> Option<CSeq> {
        self.headers.cseq()
    }

    /// Body as text (SDP answers are ASCII)
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn to_bytes(&self) -> Bytes {
        serialize_parts(
            &format!("SIP/2.0 {} {}", self.status_code, self.reason),
            &self.headers,
            &self.body,
        )
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (head_len, sep_len) = find_header_end(data)
            .ok_or_else(|| ParseError::malformed("missing end of headers"))?;
        let head = std::str::from_utf8(&data[..head_len])
            .map_err(|_| ParseError::malformed("header section is not UTF-8"))?;
        let rest = &data[head_len + sep_len..];

        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let start_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| ParseError::malformed("empty start line"))?;

        let mut headers = Headers::new();
        let mut content_length = None;
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                return Err(ParseError::malformed("folded header line"));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::malformed(format!("header without colon: {}", line)))?;
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(ParseError::malformed(format!("invalid header name: {}", line)));
            }
            let name = expand_compact_name(&name).to_string();
            let value = value.trim();

            if name == "content-length" {
                let declared = value
                    .parse::<usize>()
                    .map_err(|_| ParseError::malformed(format!("invalid Content-Length: {}", value)))?;
                content_length = Some(declared);
            } else {
                headers.push(&name, value);
            }
        }

        if let Some(declared) = content_length {
            if declared != rest.len() {
                return Err(ParseError::LengthMismatch {
                    declared,
                    actual: rest.len(),
                });
            }
        }
        let body = Bytes::copy_from_slice(rest);

        if let Some(status_part) = start_line.strip_prefix("SIP/2.0 ") {
            let (code, reason) = match status_part.split_once(' ') {
                Some((code, reason)) => (code, reason),
                None => (status_part, ""),
            };
            let status_code = code
                .parse::<u16>()
                .ok()
                .filter(|c| (100..700).contains(c))
                .ok_or_else(|| ParseError::malformed(format!("invalid status code: {}", code)))?;
            Ok(SipMessage::Response(SipResponse {
                status_code,
                reason: reason.to_string(),
                headers,
                body,
            }))
        } else {
            let mut parts = start_line.split(' ');
            let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(m), Some(u), Some(v), None) if !u.is_empty() => (m, u, v),
                _ => {
                    return Err(ParseError::malformed(format!(
                        "invalid request line: {}",
                        start_line
                    )))
                }
            };
            if version != "SIP/2.0" {
                return Err(ParseError::malformed(format!("unsupported version: {}", version)));
            }
            Ok(SipMessage::Request(SipRequest {
                method: method.parse()?,
                uri: uri.to_string(),
                headers,
                body,
            }))
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    data.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2))
}

fn serialize_parts(start_line: &str, headers: &Headers, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers.ordered() {
        buf.put_slice(wire_name(name).as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// Default reason phrase for the status codes this endpoint emits
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_request() {
        let data = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com"));
        assert_eq!(req.cseq(), Some(CSeq::new(314159, SipMethod::Register)));
        assert_eq!(req.headers.expires(), Some(3600));
        assert_eq!(req.headers.via_branch(), Some("z9hG4bK776asdhds"));

        let from = req.headers.from_addr().unwrap();
        assert_eq!(from.display_name.as_deref(), Some("Alice"));
        assert_eq!(from.uri, "sip:alice@example.com");
        assert_eq!(from.tag(), Some("1928301774"));
        assert_eq!(req.headers.to_addr().unwrap().tag(), None);
    }

    #[test]
    fn test_parse_response_with_body() {
        let body = "v=0\r\nm=audio 10000 RTP/AVP 0 8 101\r\n";
        let data = format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
             From: <sip:alice@example.com>;tag=1928301774\r\n\
             To: <sip:100@example.com>;tag=a6c85cf\r\n\
             Call-ID: a84b4c76e66710\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let resp = SipResponse::parse(data.as_bytes()).unwrap();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.reason, "OK");
        assert!(resp.is_success());
        assert_eq!(resp.body_text(), body);
        assert_eq!(resp.headers.to_addr().unwrap().tag(), Some("a6c85cf"));
    }

    #[test]
    fn test_reason_phrase_with_spaces() {
        let data = b"SIP/2.0 481 Call/Transaction Does Not Exist\r\nCall-ID: x\r\nCSeq: 2 BYE\r\n\r\n";
        let resp = SipResponse::parse(data).unwrap();
        assert_eq!(resp.status_code, 481);
        assert_eq!(resp.reason, "Call/Transaction Does Not Exist");
    }

    #[test]
    fn test_folded_header_rejected() {
        let data = b"OPTIONS sip:a@b SIP/2.0\r\nSubject: first\r\n second line\r\n\r\n";
        let err = SipMessage::parse(data).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_content_length_mismatch() {
        let data = b"SIP/2.0 200 OK\r\nCall-ID: x\r\nContent-Length: 10\r\n\r\nshort";
        let err = SipMessage::parse(data).unwrap_err();
        assert_eq!(
            err,
            ParseError::LengthMismatch {
                declared: 10,
                actual: 5
            }
        );
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(SipMessage::parse(b"").is_err());
        assert!(SipMessage::parse(b"hello world\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"SIP/2.0 abc OK\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:a@b SIP/3.0\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:a@b SIP/2.0\r\nno colon here\r\n\r\n").is_err());
    }

    #[test]
    fn test_compact_headers_expanded() {
        let data = b"SIP/2.0 100 Trying\r\nv: SIP/2.0/UDP h;branch=z9hG4bK1\r\ni: abc\r\nl: 0\r\n\r\n";
        let resp = SipResponse::parse(data).unwrap();
        assert_eq!(resp.call_id(), Some("abc"));
        assert_eq!(resp.headers.via_branch(), Some("z9hG4bK1"));
    }

    #[test]
    fn test_serialize_orders_mandatory_headers() {
        let mut req = SipRequest::new(SipMethod::Invite, "sip:100@example.com");
        req.headers.push("Content-Type", "application/sdp");
        req.headers.push("User-Agent", "sipdialer");
        req.headers.push("CSeq", "1 INVITE");
        req.headers.push("Call-ID", "abc@host");
        req.headers.push("To", "<sip:100@example.com>");
        req.headers.push("From", "<sip:alice@example.com>;tag=1");
        req.headers.push("Via", "SIP/2.0/UDP 10.0.0.1:5070;branch=z9hG4bKa");
        req.headers.push("Via", "SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKb");
        req.body = Bytes::from_static(b"v=0\r\n");

        let text = String::from_utf8(req.to_bytes().to_vec()).unwrap();
        let expected = "INVITE sip:100@example.com SIP/2.0\r\n\
                        Via: SIP/2.0/UDP 10.0.0.1:5070;branch=z9hG4bKa\r\n\
                        Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKb\r\n\
                        From: <sip:alice@example.com>;tag=1\r\n\
                        To: <sip:100@example.com>\r\n\
                        Call-ID: abc@host\r\n\
                        CSeq: 1 INVITE\r\n\
                        Content-Type: application/sdp\r\n\
                        User-Agent: sipdialer\r\n\
                        Content-Length: 5\r\n\r\nv=0\r\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_round_trip_identity() {
        let mut resp = SipResponse::new(401, "Unauthorized");
        resp.headers.push("WWW-Authenticate", r#"Digest realm="example.com", nonce="abc123", qop="auth""#);
        resp.headers.push("CSeq", "1 REGISTER");
        resp.headers.push("Call-ID", "reg-1");
        resp.headers.push("Via", "SIP/2.0/UDP 10.0.0.1:5070;branch=z9hG4bK1");

        let wire = resp.to_bytes();
        let parsed = SipResponse::parse(&wire).unwrap();
        assert_eq!(parsed, resp);
        assert_eq!(parsed.to_bytes(), wire);
    }

    #[test]
    fn test_headers_set_replaces_all_values() {
        let mut headers = Headers::new();
        headers.push("Via", "a");
        headers.push("Via", "b");
        headers.push("Call-ID", "x");
        headers.set("via", "c");

        assert_eq!(headers.get_all("Via").collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(headers.call_id(), Some("x"));
    }

    #[test]
    fn test_name_addr_forms() {
        let addr: NameAddr = "sip:bob@example.com;tag=88".parse().unwrap();
        assert_eq!(addr.uri, "sip:bob@example.com");
        assert_eq!(addr.tag(), Some("88"));

        let addr: NameAddr = "\"Bob Smith\" <sip:bob@example.com;transport=udp>;tag=9"
            .parse()
            .unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Bob Smith"));
        assert_eq!(addr.uri, "sip:bob@example.com;transport=udp");
        assert_eq!(addr.to_string(), "\"Bob Smith\" <sip:bob@example.com;transport=udp>;tag=9");
    }
}
