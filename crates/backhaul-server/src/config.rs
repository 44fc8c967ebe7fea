//! Server configuration

use backhaul_connection::HeartbeatSettings;
use backhaul_proto::MAX_FRAME_SIZE;
use backhaul_router::PortRange;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Where clients open control connections
    pub control_addr: SocketAddr,
    /// Address public TCP tunnel listeners bind to
    pub tcp_bind_host: IpAddr,
    /// Shared HTTP virtual-host listener; HTTP tunnels are refused without it
    pub http_addr: Option<SocketAddr>,
    /// Shared HTTPS virtual-host listener; needs `tls`
    pub https_addr: Option<SocketAddr>,
    pub tls: Option<TlsFiles>,
    /// Wrap the control listener in TLS as well (needs `tls`)
    pub control_tls: bool,
    /// Pre-shared token clients must send in the `authToken` extra
    pub auth_token: Option<String>,
    pub port_range: PortRange,
    /// If non-empty, only these ports may be requested or allocated
    pub allowed_ports: Vec<u16>,
    pub heartbeat: HeartbeatSettings,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7000),
            tcp_bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_addr: None,
            https_addr: None,
            tls: None,
            control_tls: false,
            auth_token: None,
            port_range: PortRange::default(),
            allowed_ports: Vec::new(),
            heartbeat: HeartbeatSettings::default(),
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

/// PEM certificate chain and private key
#[derive(Debug, Clone, Deserialize)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}
