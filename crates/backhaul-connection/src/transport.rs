//! Byte-stream transports for the control connection (plain TCP or TLS)

use crate::tls::TlsClientSettings;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Any bidirectional stream a control channel can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Open a control connection to `addr`, optionally wrapped in TLS
pub async fn connect(
    addr: &str,
    tls: Option<&TlsClientSettings>,
) -> Result<(BoxedStream, SocketAddr), TransportError> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true)?;
    let peer = tcp.peer_addr()?;

    match tls {
        None => {
            debug!("Connected to {} over TCP", peer);
            Ok((Box::new(tcp), peer))
        }
        Some(settings) => {
            let server_name = settings.server_name(addr)?;
            let stream = settings
                .connector()
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::TlsError(e.to_string()))?;
            debug!("Connected to {} over TLS", peer);
            Ok((Box::new(stream), peer))
        }
    }
}
