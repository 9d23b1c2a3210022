//! SIP Digest Authentication, client side (RFC 2617, RFC 3261)

use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Nonce count; a fresh challenge is answered exactly once
pub const NONCE_COUNT: &str = "00000001";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("incomplete challenge: missing {0}")]
    IncompleteChallenge(&'static str),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported qop: {0}")]
    UnsupportedQop(String),
}

/// Parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    /// Selected quality of protection (`auth`), `None` for RFC 2069 servers
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse a challenge header value
    pub fn parse(header_value: &str) -> Result<Self, AuthError> {
        let params = parse_digest_params(header_value);

        let realm = params
            .get("realm")
            .cloned()
            .ok_or(AuthError::IncompleteChallenge("realm"))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or(AuthError::IncompleteChallenge("nonce"))?;

        let algorithm = params
            .get("algorithm")
            .cloned()
            .unwrap_or_else(|| "MD5".to_string());
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(AuthError::UnsupportedAlgorithm(algorithm));
        }

        let qop = match params.get("qop") {
            None => None,
            Some(list) => {
                if list.split(',').map(str::trim).any(|q| q == "auth") {
                    Some("auth".to_string())
                } else {
                    return Err(AuthError::UnsupportedQop(list.clone()));
                }
            }
        };

        Ok(Self {
            realm,
            nonce,
            algorithm: "MD5".to_string(),
            qop,
            opaque: params.get("opaque").cloned(),
        })
    }
}

/// Parse Digest authentication parameters.
///
/// Quoted values may contain commas (`qop="auth,auth-int"`), so splitting
/// tracks quote state instead of splitting on every comma.
pub fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    let trimmed = value.trim();
    let digest_str = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("digest ") => &trimmed[7..],
        _ => trimmed,
    };

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in digest_str.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }

    params
}

/// Fresh client nonce for one authentication attempt
pub fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

/// Calculate the digest response value
pub fn calculate_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    cnonce: &str,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!(
        "{:x}",
        md5::compute(format!("{}:{}:{}", username, challenge.realm, password))
    );

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:nc:cnonce:qop:HA2) or MD5(HA1:nonce:HA2)
    match &challenge.qop {
        Some(qop) => format!(
            "{:x}",
            md5::compute(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, challenge.nonce, NONCE_COUNT, cnonce, qop, ha2
            ))
        ),
        None => format!(
            "{:x}",
            md5::compute(format!("{}:{}:{}", ha1, challenge.nonce, ha2))
        ),
    }
}

/// Build the `Authorization` / `Proxy-Authorization` header value
pub fn compute_authorization(
    username: &str,
    password: &str,
    method: &str,
    request_uri: &str,
    challenge: &DigestChallenge,
    cnonce: &str,
) -> String {
    let response = calculate_response(username, password, method, request_uri, challenge, cnonce);
    debug!("Computed digest response for {} {}", method, request_uri);

    let mut value = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
        username, challenge.realm, challenge.nonce, request_uri, response, challenge.algorithm
    );
    if let Some(qop) = &challenge.qop {
        value.push_str(&format!(
            r#", qop={}, nc={}, cnonce="{}""#,
            qop, NONCE_COUNT, cnonce
        ));
    }
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    value
}

/// Header carrying the challenge for a 401 or 407 response
pub fn challenge_header_name(status: u16) -> &'static str {
    if status == 407 {
        "Proxy-Authenticate"
    } else {
        "WWW-Authenticate"
    }
}

/// Header carrying the credentials answering a 401 or 407 response
pub fn authorization_header_name(status: u16) -> &'static str {
    if status == 407 {
        "Proxy-Authorization"
    } else {
        "Authorization"
    }
}
