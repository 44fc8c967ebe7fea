//! Client configuration

use crate::options::{ClientOptions, RetryPolicy};
use backhaul_connection::{HeartbeatSettings, ReconnectConfig, TlsClientSettings, TransportError};
use backhaul_crypto::DEFAULT_RSA_BITS;
use backhaul_proto::{extras, TunnelRequest, TunnelType, MAX_FRAME_SIZE};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TransportError),

    #[error("Tunnel {name}: {reason}")]
    InvalidTunnel { name: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// `host:port` of the server's control listener
    pub server_addr: String,
    pub auth_token: Option<String>,
    /// Negotiate RSA/AES payload encryption
    pub encrypt: bool,
    pub compress: bool,
    pub rsa_bits: usize,
    /// Control connection over TLS when present
    pub tls: Option<ClientTls>,
    pub heartbeat: HeartbeatSettings,
    pub retry: RetrySettings,
    pub reconnect: ReconnectSettings,
    pub max_frame_size: usize,
    pub tunnels: Vec<TunnelDefinition>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".to_string(),
            auth_token: None,
            encrypt: false,
            compress: false,
            rsa_bits: DEFAULT_RSA_BITS,
            tls: None,
            heartbeat: HeartbeatSettings::default(),
            retry: RetrySettings::default(),
            reconnect: ReconnectSettings::default(),
            max_frame_size: MAX_FRAME_SIZE as usize,
            tunnels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientTls {
    /// PEM bundle to trust instead of the webpki roots
    pub ca_path: Option<PathBuf>,
    /// Overrides the host part of `server_addr` for SNI and verification
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub on_disconnect: bool,
    pub on_error: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            on_disconnect: true,
            on_error: false,
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        let mut policy = RetryPolicy::NEVER;
        if settings.on_disconnect {
            policy = policy.with_retry_on_disconnect();
        }
        if settings.on_error {
            policy = policy.with_retry_on_error();
        }
        policy
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
            multiplier: defaults.multiplier,
            max_attempts: defaults.max_attempts,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        ReconnectConfig {
            initial_backoff: std::time::Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: std::time::Duration::from_millis(settings.max_backoff_ms),
            multiplier: settings.multiplier.max(1.0),
            max_attempts: settings.max_attempts,
        }
    }
}

/// Basic-Auth gate for an HTTP tunnel
#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuthDefinition {
    #[serde(default)]
    pub realm: Option<String>,
    pub username: String,
    pub password: String,
}

/// One tunnel of the config file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    #[serde(default = "default_local_address")]
    pub local_address: String,
    pub local_port: u16,
    /// TCP only; omitted or `0` lets the server pick
    #[serde(default)]
    pub remote_port: u16,
    pub virtual_host: Option<String>,
    pub basic_auth: Option<BasicAuthDefinition>,
    #[serde(default)]
    pub rewrite_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub add_headers: BTreeMap<String, String>,
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

impl ClientConfig {
    pub fn to_options(&self) -> Result<ClientOptions, ConfigError> {
        let tls = match &self.tls {
            Some(tls) => {
                let settings = TlsClientSettings::new(tls.ca_path.as_deref())?;
                Some(match &tls.server_name {
                    Some(name) => settings.with_server_name(name),
                    None => settings,
                })
            }
            None => None,
        };

        Ok(ClientOptions {
            tls,
            heartbeat: self.heartbeat.into(),
            retry: self.retry.into(),
            reconnect: (&self.reconnect).into(),
            compress: self.compress,
            rsa_bits: self.rsa_bits,
            max_frame_size: self.max_frame_size,
        })
    }

    /// Requests for every configured tunnel, stamped with client identity
    pub fn requests(&self) -> Result<Vec<TunnelRequest>, ConfigError> {
        self.tunnels
            .iter()
            .map(|tunnel| {
                let mut request = tunnel.to_request()?;
                if let Some(token) = &self.auth_token {
                    request = request.with_extra(extras::AUTH_TOKEN, token.as_str());
                }
                Ok(request
                    .with_extra(extras::CLIENT_VERSION, env!("CARGO_PKG_VERSION"))
                    .with_extra(extras::CLIENT_OS, std::env::consts::OS))
            })
            .collect()
    }
}

impl TunnelDefinition {
    pub fn to_request(&self) -> Result<TunnelRequest, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidTunnel {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        let request = match self.tunnel_type {
            TunnelType::Tcp => {
                if self.virtual_host.is_some() {
                    return Err(invalid("virtual_host is only valid for http/https"));
                }
                TunnelRequest::tcp(&self.local_address, self.local_port, self.remote_port)
            }
            TunnelType::Http | TunnelType::Https => {
                let host = self
                    .virtual_host
                    .as_deref()
                    .ok_or_else(|| invalid("virtual_host is required"))?;
                if self.tunnel_type == TunnelType::Http {
                    TunnelRequest::http(&self.local_address, self.local_port, host)
                } else {
                    TunnelRequest::https(&self.local_address, self.local_port, host)
                }
            }
            TunnelType::Unknown => return Err(invalid("unknown tunnel type")),
        };
        let mut request = request.with_extra(extras::NAME, self.name.as_str());

        if let Some(auth) = &self.basic_auth {
            request = request
                .with_extra(extras::ENABLE_BASIC_AUTH, "true")
                .with_extra(extras::BASIC_AUTH_USERNAME, auth.username.as_str())
                .with_extra(extras::BASIC_AUTH_PASSWORD, auth.password.as_str());
            if let Some(realm) = &auth.realm {
                request = request.with_extra(extras::BASIC_AUTH_REALM, realm.as_str());
            }
        }
        if !self.rewrite_headers.is_empty() {
            request = request.with_extra(extras::REWRITE_HEADERS, header_json(&self.rewrite_headers));
        }
        if !self.add_headers.is_empty() {
            request = request.with_extra(extras::ADD_HEADERS, header_json(&self.add_headers));
        }
        Ok(request)
    }
}

fn header_json(headers: &BTreeMap<String, String>) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string())
}
