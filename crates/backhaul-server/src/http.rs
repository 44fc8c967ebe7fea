//! Shared HTTP/HTTPS virtual-host listener

use crate::dispatch::{forward, open_session};
use crate::server::ServerContext;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Largest request head accepted before the body
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("Request head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,

    #[error("Connection closed mid-head")]
    Incomplete,
}

/// Parsed request line and headers of one public HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequestHead {
    pub method: String,
    pub path: String,
    /// Minor version: `1` for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub peer_addr: SocketAddr,
    pub https: bool,
}

impl HttpRequestHead {
    /// Parse a head from the front of `buf`
    ///
    /// Returns the head and its length in bytes, or `None` if `buf` does not
    /// hold a complete head yet.
    pub fn parse(
        buf: &[u8],
        peer_addr: SocketAddr,
        https: bool,
    ) -> Result<Option<(Self, usize)>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let len = match request.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let head = Self {
            method: request.method.unwrap_or("GET").to_string(),
            path: request.path.unwrap_or("/").to_string(),
            version: request.version.unwrap_or(1),
            headers: request
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
            peer_addr,
            https,
        };
        Ok(Some((head, len)))
    }

    /// First value of `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace every `name` header with a single `value`
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.headers[first].1 = value.to_string();
                let mut index = 0;
                self.headers.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.append_header(name, value),
        }
    }

    pub fn append_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn host(&self) -> Option<&str> {
        self.header("Host").filter(|h| !h.trim().is_empty())
    }

    /// `Connection: upgrade` with an `Upgrade` header, e.g. WebSocket
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self
            .header("Connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false);
        connection_upgrade && self.header("Upgrade").is_some()
    }

    /// Serialize back to wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.{}\r\n", self.method, self.path, self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Read until a full head is buffered
///
/// Returns the head plus any bytes read past it (start of the body), or `None`
/// if the peer closed before sending anything.
pub async fn read_head<S>(
    stream: &mut S,
    peer_addr: SocketAddr,
    https: bool,
) -> Result<Option<(HttpRequestHead, Vec<u8>)>, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(HeadError::Incomplete)
            };
        }

        if let Some((head, len)) = HttpRequestHead::parse(&buf, peer_addr, https)? {
            let rest = buf.split_off(len).to_vec();
            return Ok(Some((head, rest)));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HeadError::TooLarge);
        }
    }
}

fn error_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

async fn reply<S>(stream: &mut S, response: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(response).await?;
    stream.shutdown().await
}

/// Accept loop of the shared HTTP (no acceptor) or HTTPS listener
pub(crate) async fn serve_vhosts(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<ServerContext>,
) {
    let https = acceptor.is_some();
    let scheme = if https { "HTTPS" } else { "HTTP" };
    if let Ok(addr) = listener.local_addr() {
        info!("{} listener on {}", scheme, addr);
    }

    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept {} connection: {}", scheme, e);
                    continue;
                }
            },
        };

        let _ = socket.set_nodelay(true);
        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(tls) => handle_connection(tls, peer_addr, true, ctx).await,
                    Err(e) => {
                        debug!("TLS handshake with {} failed: {}", peer_addr, e);
                        return;
                    }
                },
                None => handle_connection(socket, peer_addr, false, ctx).await,
            };
            if let Err(e) = result {
                debug!("{} connection from {} failed: {}", scheme, peer_addr, e);
            }
        });
    }

    debug!("{} listener stopped", scheme);
}

async fn handle_connection<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    https: bool,
    ctx: Arc<ServerContext>,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut head, rest) = match read_head(&mut stream, peer_addr, https).await {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Ok(()),
        Err(HeadError::Io(e)) => return Err(e),
        Err(e) => {
            debug!("Bad request from {}: {}", peer_addr, e);
            return reply(&mut stream, &error_response("400 Bad Request", "Bad Request\n")).await;
        }
    };

    let descriptor = match head.host().and_then(|host| ctx.vhosts.lookup(host, https)) {
        Some(descriptor) => descriptor,
        None => {
            debug!("No tunnel for host {:?} ({})", head.host(), peer_addr);
            return reply(&mut stream, &error_response("404 Not Found", "Tunnel not found\n")).await;
        }
    };

    let tunnel = descriptor.request().clone();
    for interceptor in &ctx.http_interceptors {
        if let Some(response) = interceptor.handle(&mut head, &tunnel).await {
            return reply(&mut stream, &response).await;
        }
    }

    if !head.is_upgrade() {
        // One session carries exactly one request
        head.set_header("Connection", "close");
    }

    let Some(session) = open_session(&descriptor).await else {
        warn!(
            "Tunnel {} could not reach {}",
            descriptor.tunnel_id(),
            tunnel.local_target()
        );
        return reply(&mut stream, &error_response("502 Bad Gateway", "Bad Gateway\n")).await;
    };

    debug!(
        "{} {} {} -> tunnel {} session {}",
        peer_addr,
        head.method,
        head.path,
        descriptor.tunnel_id(),
        session.session_id()
    );

    let mut initial = head.to_bytes();
    initial.extend_from_slice(&rest);
    forward(stream, session, Some(initial)).await;
    Ok(())
}
