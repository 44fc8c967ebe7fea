//! One tunnel connection: connect, handshake, serve, retry

use crate::error::TunnelError;
use crate::handshake::{handshake, HandshakeParams};
use crate::listener::ConnectionListener;
use crate::options::ClientOptions;
use crate::tunnel::{serve, LocalTunnel};
use backhaul_connection::{
    connect, ControlChannel, ReconnectError, ReconnectManager, TrafficListener, TrafficMeter,
    TrafficSnapshot,
};
use backhaul_proto::{FrameCodec, TunnelRequest};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a tunnel connection
///
/// `Failed` is transient while a retry is pending; a connection that gives up
/// ends in `Closed` with the last error kept in [`ConnectionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    HandshakeSent,
    Established,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::HandshakeSent => "HANDSHAKE_SENT",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Observable status, published on every transition
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Server-assigned id while established
    pub tunnel_id: Option<i64>,
    /// The request as accepted by the server while established
    pub request: Option<TunnelRequest>,
    pub last_error: Option<TunnelError>,
}

impl ConnectionStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Connecting,
            tunnel_id: None,
            request: None,
            last_error: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }
}

/// Serialisable view for status endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub server_addr: String,
    pub state: ConnectionState,
    pub tunnel_id: Option<i64>,
    pub request: TunnelRequest,
    pub traffic: TrafficSnapshot,
    pub last_error: Option<String>,
}

struct Inner {
    server_addr: String,
    request: TunnelRequest,
    encrypt: bool,
    status: watch::Sender<ConnectionStatus>,
    /// Set by an explicit close; no retry is started once this is set
    closing: AtomicBool,
    cancel: CancellationToken,
    meter: TrafficMeter,
}

impl Inner {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
            if state != ConnectionState::Established {
                status.tunnel_id = None;
                status.request = None;
            }
        });
    }

    fn set_established(&self, tunnel_id: i64, request: TunnelRequest) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Established;
            status.tunnel_id = Some(tunnel_id);
            status.request = Some(request);
            status.last_error = None;
        });
    }

    fn set_failed(&self, state: ConnectionState, error: Option<TunnelError>) {
        self.status.send_modify(|status| {
            status.state = state;
            status.tunnel_id = None;
            status.request = None;
            if error.is_some() {
                status.last_error = error;
            }
        });
    }
}

/// Handle to a tunnel connection driven by a background task
///
/// Cloning is cheap; all clones observe the same connection.
#[derive(Clone)]
pub struct TunnelConnection {
    inner: Arc<Inner>,
}

impl TunnelConnection {
    pub(crate) fn spawn(
        server_addr: String,
        request: TunnelRequest,
        encrypt: bool,
        options: Arc<ClientOptions>,
        listener: ConnectionListener,
        traffic: TrafficListener,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::initial());
        let meter = TrafficMeter::new(Arc::new(request.clone()), traffic);
        let inner = Arc::new(Inner {
            server_addr,
            request,
            encrypt,
            status,
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            meter,
        });

        tokio::spawn(run(inner.clone(), options, listener));
        Self { inner }
    }

    pub fn server_addr(&self) -> &str {
        &self.inner.server_addr
    }

    /// The request as submitted; see [`TunnelConnection::established_request`]
    pub fn request(&self) -> &TunnelRequest {
        &self.inner.request
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn tunnel_id(&self) -> Option<i64> {
        self.inner.status.borrow().tunnel_id
    }

    pub fn established_request(&self) -> Option<TunnelRequest> {
        self.inner.status.borrow().request.clone()
    }

    pub fn last_error(&self) -> Option<TunnelError> {
        self.inner.status.borrow().last_error.clone()
    }

    /// Wait until the tunnel is established and return the final request
    ///
    /// Fails once the connection has given up for good.
    pub async fn wait_established(&self) -> Result<TunnelRequest, TunnelError> {
        let mut rx = self.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                if let (ConnectionState::Established, Some(request)) =
                    (status.state, &status.request)
                {
                    return Ok(request.clone());
                }
                if status.is_closed() {
                    return Err(status.last_error.clone().unwrap_or(TunnelError::Closed));
                }
            }
            if rx.changed().await.is_err() {
                return Err(TunnelError::Closed);
            }
        }
    }

    /// Close the connection and cancel any pending retry
    pub fn close(&self) {
        if !self.inner.closing.swap(true, Ordering::SeqCst) {
            debug!("Closing tunnel connection to {}", self.inner.server_addr);
        }
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.status.borrow().is_closed()
    }

    /// Resolves once the connection reached `Closed`
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(ConnectionStatus::is_closed).await;
    }

    /// Totals over every attempt of this connection
    pub fn traffic(&self) -> TrafficSnapshot {
        self.inner.meter.stats().snapshot()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let status = self.status();
        ConnectionSnapshot {
            server_addr: self.inner.server_addr.clone(),
            state: status.state,
            tunnel_id: status.tunnel_id,
            request: status.request.unwrap_or_else(|| self.inner.request.clone()),
            traffic: self.traffic(),
            last_error: status.last_error.map(|e| e.to_string()),
        }
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("server_addr", &self.inner.server_addr)
            .field("request", &self.inner.request)
            .field("state", &self.state())
            .finish()
    }
}

/// How one attempt ended
struct AttemptEnd {
    established: bool,
    error: Option<TunnelError>,
}

impl AttemptEnd {
    fn cancelled() -> Self {
        Self {
            established: false,
            error: None,
        }
    }

    fn failed(error: TunnelError) -> Self {
        Self {
            established: false,
            error: Some(error),
        }
    }
}

async fn run(inner: Arc<Inner>, options: Arc<ClientOptions>, listener: ConnectionListener) {
    let mut backoff = ReconnectManager::new(options.reconnect.clone());

    loop {
        if inner.is_closing() {
            break;
        }

        inner.set_state(ConnectionState::Connecting);
        listener.notify_connecting(&inner.request);

        let end = attempt(&inner, &options, &listener, &mut backoff).await;
        if end.established || end.error.is_some() {
            listener.notify_disconnected(&inner.request, end.error.as_ref());
        }
        if inner.is_closing() {
            break;
        }

        let retry = if end.established {
            options.retry.on_disconnect()
        } else {
            options.retry.on_error()
        };

        match &end.error {
            Some(e) => warn!("Tunnel {} to {} ended: {}", inner.request, inner.server_addr, e),
            None => info!("Tunnel {} to {} ended", inner.request, inner.server_addr),
        }

        if !retry {
            inner.set_failed(ConnectionState::Closed, end.error);
            return;
        }

        inner.set_failed(ConnectionState::Failed, end.error);
        match backoff.wait(&inner.cancel).await {
            Ok(()) => continue,
            Err(ReconnectError::MaxAttemptsReached) => {
                warn!(
                    "Giving up on tunnel {} after {} attempts",
                    inner.request,
                    backoff.attempt() - 1
                );
                inner.set_failed(ConnectionState::Closed, None);
                return;
            }
            Err(ReconnectError::Cancelled) => break,
        }
    }

    inner.set_state(ConnectionState::Closed);
}

async fn attempt(
    inner: &Inner,
    options: &ClientOptions,
    listener: &ConnectionListener,
    backoff: &mut ReconnectManager,
) -> AttemptEnd {
    let connected = tokio::select! {
        _ = inner.cancel.cancelled() => return AttemptEnd::cancelled(),
        connected = connect(&inner.server_addr, options.tls.as_ref()) => connected,
    };
    let (stream, peer) = match connected {
        Ok(connected) => connected,
        Err(e) => return AttemptEnd::failed(e.into()),
    };

    let codec = FrameCodec::with_max_frame_size(options.max_frame_size);
    let mut channel = ControlChannel::new(stream, codec, options.heartbeat);
    let params = HandshakeParams {
        encrypt: inner.encrypt,
        compress: options.compress,
        rsa_bits: options.rsa_bits,
        max_frame_size: options.max_frame_size,
    };

    let granted = tokio::select! {
        _ = inner.cancel.cancelled() => return AttemptEnd::cancelled(),
        granted = handshake(&mut channel, &inner.request, params, || {
            inner.set_state(ConnectionState::HandshakeSent)
        }) => granted,
    };
    let granted = match granted {
        Ok(granted) => granted,
        Err(e) => {
            channel.close();
            return AttemptEnd::failed(e);
        }
    };

    backoff.reset();
    info!(
        "Tunnel {} established via {} ({})",
        granted.tunnel_id, peer, granted.request
    );
    // Observers run before waiters on the state are released
    listener.notify_connected(&granted.request);
    inner.set_established(granted.tunnel_id, granted.request.clone());

    let tunnel = LocalTunnel::new(
        granted.tunnel_id,
        granted.request,
        channel.sender(),
        granted.payload,
        inner.meter.clone(),
    );
    let result = serve(&mut channel, &tunnel, &inner.cancel).await;
    tunnel.sessions.dispose().await;
    channel.close();

    AttemptEnd {
        established: true,
        error: result.err(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RetryPolicy;
    use backhaul_connection::{BoxedStream, HeartbeatConfig, ReconnectConfig};
    use backhaul_proto::{Command, ProtoMessage};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn options(retry: RetryPolicy) -> Arc<ClientOptions> {
        Arc::new(ClientOptions {
            retry,
            heartbeat: HeartbeatConfig::disabled(),
            reconnect: ReconnectConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                multiplier: 2.0,
                max_attempts: None,
            },
            ..ClientOptions::default()
        })
    }

    /// Accepts one control connection and answers the handshake
    async fn accept_handshake(listener: &TcpListener, reply: Option<&str>) -> ControlChannel {
        let (socket, _) = listener.accept().await.unwrap();
        let stream: BoxedStream = Box::new(socket);
        let mut channel = ControlChannel::new(stream, FrameCodec::new(), HeartbeatConfig::disabled());

        let hello = channel.recv().await.unwrap().unwrap();
        assert_eq!(hello.command, Command::Handshake);
        channel.send(ProtoMessage::response_ok(0, Vec::new())).await.unwrap();

        let request = channel.recv().await.unwrap().unwrap();
        assert_eq!(request.command, Command::Request);
        match reply {
            Some(reason) => {
                channel.send(ProtoMessage::response_rejected(reason)).await.unwrap();
            }
            None => {
                let granted = TunnelRequest::from_json(&request.body)
                    .unwrap()
                    .with_remote_port(40001);
                channel
                    .send(ProtoMessage::response_ok(11, granted.to_json().unwrap()))
                    .await
                    .unwrap();
            }
        }
        channel
    }

    #[tokio::test]
    async fn test_established_then_explicit_close() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let connection = TunnelConnection::spawn(
            addr,
            TunnelRequest::tcp("127.0.0.1", 22, 0),
            false,
            options(RetryPolicy::ALWAYS),
            ConnectionListener::default(),
            TrafficListener::default(),
        );
        let mut server_side = accept_handshake(&server, None).await;

        let granted = connection.wait_established().await.unwrap();
        assert_eq!(granted.remote_port, 40001);
        assert_eq!(connection.tunnel_id(), Some(11));
        assert_eq!(connection.state(), ConnectionState::Established);

        connection.close();
        connection.closed().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(server_side.recv().await.unwrap(), None);

        // No reconnect after an explicit close
        let extra = tokio::time::timeout(Duration::from_millis(100), server.accept()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_rejection_without_error_retry_closes() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let connection = TunnelConnection::spawn(
            addr,
            TunnelRequest::tcp("127.0.0.1", 22, 0),
            false,
            options(RetryPolicy::NEVER.with_retry_on_disconnect()),
            ConnectionListener::default(),
            TrafficListener::default(),
        );
        let _server_side = accept_handshake(&server, Some("bad auth token")).await;

        let err = connection.wait_established().await.unwrap_err();
        assert_eq!(err, TunnelError::Rejected("bad auth token".to_string()));
        assert!(connection.is_closed());
        assert_eq!(connection.snapshot().last_error.as_deref(), Some("Tunnel rejected: bad auth token"));
    }

    #[tokio::test]
    async fn test_force_off_reconnects_when_retry_on_disconnect() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));
        let listener = {
            let connected = connected.clone();
            let disconnected = disconnected.clone();
            ConnectionListener::default()
                .on_connected(move |_| {
                    connected.fetch_add(1, Ordering::SeqCst);
                })
                .on_disconnected(move |_, error| {
                    if error == Some(&TunnelError::ForcedOff) {
                        disconnected.fetch_add(1, Ordering::SeqCst);
                    }
                })
        };

        let connection = TunnelConnection::spawn(
            addr,
            TunnelRequest::tcp("127.0.0.1", 22, 0),
            false,
            options(RetryPolicy::NEVER.with_retry_on_disconnect()),
            listener,
            TrafficListener::default(),
        );

        let first = accept_handshake(&server, None).await;
        connection.wait_established().await.unwrap();
        first.send(ProtoMessage::force_off(11)).await.unwrap();

        let _second = accept_handshake(&server, None).await;
        connection.wait_established().await.unwrap();
        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);

        connection.close();
        connection.closed().await;
    }

    #[tokio::test]
    async fn test_refused_connect_retries_on_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let attempts = Arc::new(AtomicUsize::new(0));
        let listener = {
            let attempts = attempts.clone();
            ConnectionListener::default().on_connecting(move |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
            })
        };

        let connection = TunnelConnection::spawn(
            addr,
            TunnelRequest::tcp("127.0.0.1", 22, 0),
            false,
            options(RetryPolicy::NEVER.with_retry_on_error()),
            listener,
            TrafficListener::default(),
        );

        let mut status = connection.subscribe();
        status
            .wait_for(|s| s.state == ConnectionState::Failed)
            .await
            .unwrap();
        drop(status);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert!(!connection.is_closed());
        assert_eq!(
            connection.last_error().map(|e| e.kind()),
            Some(crate::error::ErrorKind::Transport)
        );

        connection.close();
        connection.closed().await;
    }
}
