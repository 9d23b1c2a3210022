//! SIP message builder utilities

use super::dialog::generate_tag;
use super::message::{reason_phrase, CSeq, NameAddr, SipMethod, SipRequest, SipResponse};
use bytes::Bytes;
use std::net::SocketAddr;

pub const USER_AGENT: &str = concat!("sipdialer/", env!("CARGO_PKG_VERSION"));
const MAX_FORWARDS: u32 = 70;

/// Build an outbound SIP request
pub struct RequestBuilder {
    request: SipRequest,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        let mut request = SipRequest::new(method, uri);
        request.headers.push("Max-Forwards", MAX_FORWARDS.to_string());
        request.headers.push("User-Agent", USER_AGENT);
        Self { request }
    }

    pub fn via(mut self, transport: &str, addr: SocketAddr, branch: &str) -> Self {
        self.request.headers.set(
            "Via",
            format!("SIP/2.0/{} {};branch={};rport", transport, addr, branch),
        );
        self
    }

    pub fn from(mut self, from: &NameAddr) -> Self {
        self.request.headers.set("From", from.to_string());
        self
    }

    pub fn to(mut self, to: &NameAddr) -> Self {
        self.request.headers.set("To", to.to_string());
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.request.headers.set("Call-ID", call_id);
        self
    }

    /// CSeq number; the method is taken from the request line
    pub fn cseq(mut self, seq: u32) -> Self {
        let cseq = CSeq::new(seq, self.request.method);
        self.request.headers.set("CSeq", cseq.to_string());
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.request.headers.set("Contact", format!("<{}>", uri));
        self
    }

    pub fn expires(mut self, seconds: u32) -> Self {
        self.request.headers.set("Expires", seconds.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.request.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.request.headers.set("Content-Type", content_type);
        self.request.body = body.into();
        self
    }

    pub fn build(self) -> SipRequest {
        self.request
    }
}

/// Build a simple SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn call_does_not_exist() -> Self {
        Self::new(481)
    }

    pub fn not_implemented() -> Self {
        Self::new(501)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Copy Via/From/To/Call-ID/CSeq from the request; a To tag is added
    /// when the request had none
    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut response = SipResponse::new(self.status_code, reason_phrase(self.status_code));

        for via in request.headers.get_all("via") {
            response.headers.push("Via", via);
        }
        if let Some(from) = request.headers.get("from") {
            response.headers.push("From", from);
        }
        if let Some(to) = request.headers.get("to") {
            let to = match to.parse::<NameAddr>() {
                Ok(addr) if addr.tag().is_none() => addr.with_tag(generate_tag()).to_string(),
                _ => to.to_string(),
            };
            response.headers.push("To", to);
        }
        if let Some(call_id) = request.headers.get("call-id") {
            response.headers.push("Call-ID", call_id);
        }
        if let Some(cseq) = request.headers.get("cseq") {
            response.headers.push("CSeq", cseq);
        }
        for (name, value) in self.headers {
            response.headers.push(&name, value);
        }
        response.body = self.body;
        response
    }
}
