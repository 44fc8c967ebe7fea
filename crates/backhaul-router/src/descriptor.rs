//! Server-side record of one registered tunnel

use backhaul_connection::{
    ControlSender, PayloadCodec, SessionPipe, SessionTable, TrafficMeter, TrafficSnapshot,
};
use backhaul_proto::TunnelRequest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Binds a registry key to a session table and the control channel it came from
pub struct TunnelDescriptor {
    tunnel_id: i64,
    request: Arc<TunnelRequest>,
    sessions: Arc<SessionTable<SessionPipe>>,
    meter: TrafficMeter,
    payload: PayloadCodec,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
    registered_at: DateTime<Utc>,
}

impl TunnelDescriptor {
    pub fn new(
        tunnel_id: i64,
        request: Arc<TunnelRequest>,
        control: ControlSender,
        meter: TrafficMeter,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            tunnel_id,
            request,
            sessions: Arc::new(SessionTable::new(tunnel_id, control)),
            meter,
            payload: PayloadCodec::plain(),
            peer_addr,
            shutdown: CancellationToken::new(),
            registered_at: Utc::now(),
        }
    }

    /// Payload transforms negotiated on the owning control connection
    pub fn with_payload(mut self, payload: PayloadCodec) -> Self {
        self.payload = payload;
        self
    }

    pub fn tunnel_id(&self) -> i64 {
        self.tunnel_id
    }

    pub fn request(&self) -> &Arc<TunnelRequest> {
        &self.request
    }

    pub fn sessions(&self) -> &Arc<SessionTable<SessionPipe>> {
        &self.sessions
    }

    pub fn control(&self) -> &ControlSender {
        self.sessions.control()
    }

    pub fn meter(&self) -> &TrafficMeter {
        &self.meter
    }

    pub fn payload(&self) -> &PayloadCodec {
        &self.payload
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Cancelled when the tunnel is torn down; listeners serving it stop
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.control().is_closed()
    }

    /// Send FORCE_OFF and drop the client's control connection
    ///
    /// The close flushes FORCE_OFF first; the connection's owner then
    /// releases the registry slot. Returns false if FORCE_OFF could not be
    /// queued, in which case the connection is still closed.
    pub fn force_off(&self) -> bool {
        debug!("Force-off tunnel {} ({})", self.tunnel_id, self.request);
        let notified = match self.sessions.force_off() {
            Ok(()) => true,
            Err(e) => {
                debug!("Tunnel {}: FORCE_OFF not queued: {}", self.tunnel_id, e);
                false
            }
        };
        self.control().close();
        notified
    }

    /// Stop serving and close every session
    pub async fn teardown(&self) {
        self.shutdown.cancel();
        self.sessions.dispose().await;
    }

    pub async fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            tunnel_id: self.tunnel_id,
            request: (*self.request).clone(),
            peer_addr: self.peer_addr,
            active_sessions: self.sessions.len().await,
            traffic: self.meter.stats().snapshot(),
            registered_at: self.registered_at,
        }
    }
}

impl std::fmt::Debug for TunnelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDescriptor")
            .field("tunnel_id", &self.tunnel_id)
            .field("request", &self.request)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a registered tunnel for status endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSnapshot {
    pub tunnel_id: i64,
    pub request: TunnelRequest,
    pub peer_addr: SocketAddr,
    pub active_sessions: usize,
    pub traffic: TrafficSnapshot,
    pub registered_at: DateTime<Utc>,
}
