//! Configuration management
//!
//! Defaults, then an optional `sipdialer.toml`, then `SIPDIALER__*`
//! environment variables (`SIPDIALER__SIP__LOCAL_PORT=5080`).

use crate::domain::auto_dialer::WorkingHours;
use crate::domain::auto_hangup::AutoHangupConfig;
use crate::domain::shared::Result as DialerResult;
use crate::infrastructure::protocols::sip::{RegistrationConfig, SipTimers, TransactionConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "sipdialer.toml";
pub const ENV_PREFIX: &str = "SIPDIALER";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sip: SipConfig,
    pub auto_hangup: AutoHangupConfig,
    pub auto_dialer: AutoDialerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub local_port: u16,
    /// Address written into Via/Contact; probed from the route when unset
    pub advertised_ip: Option<IpAddr>,
    pub expires: u32,
    pub transaction_timeout_ms: u64,
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub retransmit: bool,
    pub rtp_base_port: u16,
    pub rtp_port_count: u16,
}

/// Defaults for `startAutoDialer` fields the UI leaves out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDialerConfig {
    pub working_hours_start: String,
    pub working_hours_end: String,
    pub min_interval_seconds: u64,
    pub max_interval_seconds: u64,
    pub max_active_calls: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            local_port: 5070,
            advertised_ip: None,
            expires: 3600,
            transaction_timeout_ms: 32_000,
            t1_ms: 500,
            t2_ms: 4_000,
            retransmit: true,
            rtp_base_port: 10_000,
            rtp_port_count: 1_000,
        }
    }
}

impl Default for AutoDialerConfig {
    fn default() -> Self {
        Self {
            working_hours_start: "09:00".to_string(),
            working_hours_end: "18:00".to_string(),
            min_interval_seconds: 5,
            max_interval_seconds: 15,
            max_active_calls: 1,
        }
    }
}

impl Config {
    /// Load from `path` (or `sipdialer.toml` when `None`, optional) plus the
    /// environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(path) => config::File::with_name(path),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse an inline TOML document; missing keys take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl SipConfig {
    pub fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig {
            timers: SipTimers {
                t1: Duration::from_millis(self.t1_ms),
                t2: Duration::from_millis(self.t2_ms),
            },
            timeout: Duration::from_millis(self.transaction_timeout_ms),
            retransmit: self.retransmit,
        }
    }

    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            expires: self.expires,
            ..RegistrationConfig::default()
        }
    }
}

impl AutoDialerConfig {
    pub fn working_hours(&self) -> DialerResult<WorkingHours> {
        WorkingHours::parse(&self.working_hours_start, &self.working_hours_end)
    }
}
