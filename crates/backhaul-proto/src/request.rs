//! Tunnel request descriptor exchanged during the handshake

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known keys of [`TunnelRequest::extras`]
pub mod extras {
    pub const NAME: &str = "name";
    pub const AUTH_TOKEN: &str = "authToken";
    pub const CLIENT_VERSION: &str = "clientVersion";
    pub const CLIENT_OS: &str = "clientOs";
    pub const ENABLE_BASIC_AUTH: &str = "enableBasicAuth";
    pub const BASIC_AUTH_REALM: &str = "basicAuthRealm";
    pub const BASIC_AUTH_USERNAME: &str = "basicAuthUsername";
    pub const BASIC_AUTH_PASSWORD: &str = "basicAuthPassword";
    /// JSON object of header name -> replacement value
    pub const REWRITE_HEADERS: &str = "rewriteHeaders";
    /// JSON object of header name -> value to append
    pub const ADD_HEADERS: &str = "addHeaders";
}

/// Tunnel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelType {
    Tcp,
    Http,
    Https,
    /// Anything this build does not understand; always rejected by the server
    #[serde(other)]
    Unknown,
}

impl TunnelType {
    pub fn is_http(&self) -> bool {
        matches!(self, TunnelType::Http | TunnelType::Https)
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelType::Tcp => "tcp",
            TunnelType::Http => "http",
            TunnelType::Https => "https",
            TunnelType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Basic-Auth settings carried in the extras
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthConfig {
    pub realm: String,
    pub username: String,
    pub password: String,
}

/// Immutable descriptor of one tunnel
///
/// Server-assigned fields (e.g. an allocated port) are filled in on a copy, see
/// [`TunnelRequest::with_remote_port`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub local_address: String,
    pub local_port: u16,
    /// TCP only; `0` asks the server to allocate one
    #[serde(default)]
    pub remote_port: u16,
    /// HTTP/HTTPS only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_host: Option<String>,
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

impl TunnelRequest {
    pub fn tcp(local_address: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            tunnel_type: TunnelType::Tcp,
            local_address: local_address.into(),
            local_port,
            remote_port,
            virtual_host: None,
            extras: BTreeMap::new(),
        }
    }

    pub fn http(
        local_address: impl Into<String>,
        local_port: u16,
        virtual_host: impl Into<String>,
    ) -> Self {
        Self {
            tunnel_type: TunnelType::Http,
            local_address: local_address.into(),
            local_port,
            remote_port: 0,
            virtual_host: Some(virtual_host.into()),
            extras: BTreeMap::new(),
        }
    }

    pub fn https(
        local_address: impl Into<String>,
        local_port: u16,
        virtual_host: impl Into<String>,
    ) -> Self {
        Self {
            tunnel_type: TunnelType::Https,
            ..Self::http(local_address, local_port, virtual_host)
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Copy with a server-assigned remote port
    pub fn with_remote_port(&self, remote_port: u16) -> Self {
        Self {
            remote_port,
            ..self.clone()
        }
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.extra(extras::NAME)
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.extra(extras::AUTH_TOKEN)
    }

    /// `host:port` of the local service
    pub fn local_target(&self) -> String {
        format!("{}:{}", self.local_address, self.local_port)
    }

    /// Virtual host normalised for registry lookups
    pub fn normalized_vhost(&self) -> Option<String> {
        self.virtual_host
            .as_deref()
            .map(normalize_host)
            .filter(|h| !h.is_empty())
    }

    pub fn basic_auth(&self) -> Option<BasicAuthConfig> {
        let enabled = self
            .extra(extras::ENABLE_BASIC_AUTH)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !enabled {
            return None;
        }

        Some(BasicAuthConfig {
            realm: self
                .extra(extras::BASIC_AUTH_REALM)
                .unwrap_or("backhaul")
                .to_string(),
            username: self
                .extra(extras::BASIC_AUTH_USERNAME)
                .unwrap_or_default()
                .to_string(),
            password: self
                .extra(extras::BASIC_AUTH_PASSWORD)
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub fn rewrite_headers(&self) -> BTreeMap<String, String> {
        self.header_map(extras::REWRITE_HEADERS)
    }

    pub fn add_headers(&self) -> BTreeMap<String, String> {
        self.header_map(extras::ADD_HEADERS)
    }

    fn header_map(&self, key: &str) -> BTreeMap<String, String> {
        match self.extra(key) {
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed {} extra: {}", key, e);
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl fmt::Display for TunnelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tunnel_type {
            TunnelType::Tcp => write!(
                f,
                "tcp :{} -> {}",
                self.remote_port,
                self.local_target()
            ),
            TunnelType::Http | TunnelType::Https => write!(
                f,
                "{} {} -> {}",
                self.tunnel_type,
                self.virtual_host.as_deref().unwrap_or("<none>"),
                self.local_target()
            ),
            TunnelType::Unknown => write!(f, "unknown -> {}", self.local_target()),
        }
    }
}

/// Lowercase a `Host` value and strip any port
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // IPv6 literal, e.g. [::1]:8080
        host.split(']').next().map(|h| format!("{}]", h)).unwrap_or_default()
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}
