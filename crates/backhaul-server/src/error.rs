//! Server errors

use backhaul_connection::TransportError;
use backhaul_proto::TunnelType;
use backhaul_router::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind to {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Server already started")]
    AlreadyStarted,
}

/// Why a tunnel request was refused
///
/// The `Display` text is sent to the client as the rejection reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("malformed tunnel request: {0}")]
    Malformed(String),

    #[error("unknown tunnel type")]
    UnknownTunnelType,

    #[error("bad auth token")]
    BadAuthToken,

    #[error("port {0} is not allowed")]
    PortNotAllowed(u16),

    /// Carries the pool that was searched: a range or the allow-list
    #[error("no free port in {0}")]
    NoFreePort(String),

    #[error("virtual host required")]
    MissingVirtualHost,

    #[error("{0} tunnels are not enabled on this server")]
    SchemeDisabled(TunnelType),

    #[error("{0} already used")]
    AlreadyRegistered(String),

    #[error("{0}")]
    Rejected(String),
}

impl From<RegistryError> for AdmissionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered(key) => AdmissionError::AlreadyRegistered(key),
            RegistryError::PortUnavailable(port) => {
                AdmissionError::AlreadyRegistered(format!("port {}", port))
            }
            RegistryError::NotFound(key) => AdmissionError::Rejected(format!("{} not registered", key)),
        }
    }
}
