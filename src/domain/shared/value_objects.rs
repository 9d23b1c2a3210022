//! Shared value objects

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one call attempt, as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallAttemptId(Uuid);

impl CallAttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

}

impl Default for CallAttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CallAttemptId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Account used to register with the SIP server.
/// Immutable once a dialog has started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub sip_server: String,
    pub port: u16,
}

impl Credentials {
    /// Domain used in URIs: the realm when configured, else the server host
    pub fn domain(&self) -> &str {
        match self.realm.as_deref() {
            Some(realm) if !realm.is_empty() => realm,
            _ => &self.sip_server,
        }
    }

    /// Address of record, `sip:user@domain`
    pub fn aor(&self) -> SipUri {
        SipUri::new(self.username.clone(), self.domain().to_string(), None)
    }
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: String, host: String, port: Option<u16>) -> Self {
        Self {
            user: Some(user),
            host,
            port,
        }
    }

    /// URI without a user part, e.g. the REGISTER request URI
    pub fn host_only(host: String) -> Self {
        Self {
            user: None,
            host,
            port: None,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Keep digits and a leading `+`
pub fn normalize_number(number: &str) -> String {
    number
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect()
}

/// A dialable number from the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberEntry {
    pub number: String,
    #[serde(default)]
    pub label: String,
    /// Per-number auto-hangup bounds, overriding the global ones
    #[serde(default)]
    pub min_duration_seconds: Option<u64>,
    #[serde(default)]
    pub max_duration_seconds: Option<u64>,
}

impl NumberEntry {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            label: String::new(),
            min_duration_seconds: None,
            max_duration_seconds: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(realm: Option<&str>) -> Credentials {
        Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            realm: realm.map(str::to_string),
            sip_server: "10.0.0.2".to_string(),
            port: 5060,
        }
    }

    #[test]
    fn test_domain_prefers_realm() {
        assert_eq!(credentials(Some("example.com")).domain(), "example.com");
        assert_eq!(credentials(None).domain(), "10.0.0.2");
        assert_eq!(credentials(Some("")).domain(), "10.0.0.2");
        assert_eq!(credentials(Some("example.com")).aor().to_string(), "sip:alice@example.com");
    }

    #[test]
    fn test_sip_uri_display() {
        let uri = SipUri::new("alice".to_string(), "example.com".to_string(), None);
        assert_eq!(uri.to_string(), "sip:alice@example.com");

        let uri_with_port = SipUri::new("bob".to_string(), "10.0.0.1".to_string(), Some(5070));
        assert_eq!(uri_with_port.to_string(), "sip:bob@10.0.0.1:5070");

        assert_eq!(SipUri::host_only("example.com".to_string()).to_string(), "sip:example.com");
    }

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number("+1 (555) 010-9999"), "+15550109999");
        assert_eq!(normalize_number("100"), "100");
        assert_eq!(normalize_number("ext. 42#"), "42");
        assert_eq!(normalize_number("reception"), "");
    }

    #[test]
    fn test_number_entry_wire_names() {
        let entry: NumberEntry = serde_json::from_str(
            r#"{"number":"100","label":"Front desk","minDurationSeconds":30,"maxDurationSeconds":60}"#,
        )
        .unwrap();
        assert_eq!(entry.min_duration_seconds, Some(30));
        assert_eq!(entry.max_duration_seconds, Some(60));

        let json = serde_json::to_value(NumberEntry::new("200")).unwrap();
        assert!(json.get("minDurationSeconds").is_some());
        assert!(json.get("min_duration_seconds").is_none());
    }

    #[test]
    fn test_call_attempt_id_parse() {
        let id = CallAttemptId::new();
        assert_eq!(id.to_string().parse::<CallAttemptId>().unwrap(), id);
        assert!("not-a-uuid".parse::<CallAttemptId>().is_err());
    }
}
