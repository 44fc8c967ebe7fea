//! Local forwarding for one established tunnel

use crate::error::TunnelError;
use backhaul_connection::{
    pump, ControlChannel, ControlSender, PayloadCodec, PumpEnd, SessionHandle, SessionLink,
    SessionPipe, SessionTable, Side, TrafficMeter,
};
use backhaul_proto::{Command, ProtoMessage, TransferFlags, TunnelRequest};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// State shared by the control loop and the session tasks of one tunnel
pub(crate) struct LocalTunnel {
    pub tunnel_id: i64,
    pub request: Arc<TunnelRequest>,
    pub control: ControlSender,
    pub payload: PayloadCodec,
    pub meter: TrafficMeter,
    pub sessions: Arc<SessionTable<SessionPipe>>,
}

impl LocalTunnel {
    pub fn new(
        tunnel_id: i64,
        request: TunnelRequest,
        control: ControlSender,
        payload: PayloadCodec,
        meter: TrafficMeter,
    ) -> Arc<Self> {
        Arc::new(Self {
            tunnel_id,
            request: Arc::new(request),
            sessions: Arc::new(SessionTable::new(tunnel_id, control.clone())),
            control,
            payload,
            meter,
        })
    }

    fn link(&self, session_id: i64) -> SessionLink {
        SessionLink {
            tunnel_id: self.tunnel_id,
            session_id,
            control: self.control.clone(),
            payload: self.payload.clone(),
            side: Side::Local,
        }
    }
}

/// Dispatch frames from the server until the tunnel ends
///
/// Returns `Ok(())` only when `cancel` fires.
pub(crate) async fn serve(
    channel: &mut ControlChannel,
    tunnel: &Arc<LocalTunnel>,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let tunnel_id = tunnel.tunnel_id;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = channel.recv() => match received? {
                Some(msg) => msg,
                None => return Err(TunnelError::Closed),
            },
        };

        match msg.command {
            Command::Transfer if is_open_marker(&msg) => {
                open_session(tunnel, msg.session_id).await;
            }
            Command::Transfer => {
                let data = tunnel.payload.open(msg.transfer_flags(), msg.body)?;
                match tunnel.sessions.get(msg.session_id).await {
                    // Waits while the local socket is backed up
                    Some(pipe) => tokio::select! {
                        _ = pipe.deliver(data) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    },
                    None => trace!(
                        "Dropping {} bytes for unknown session {}/{}",
                        data.len(),
                        tunnel_id,
                        msg.session_id
                    ),
                }
            }
            Command::LocalDisconnect => {
                if let Some(pipe) = tunnel.sessions.remove(msg.session_id).await {
                    trace!("Session {}/{} closed by server", tunnel_id, msg.session_id);
                    pipe.close();
                }
            }
            Command::ForceOff => {
                info!("Tunnel {} forced off by server", tunnel_id);
                return Err(TunnelError::ForcedOff);
            }
            other => {
                return Err(TunnelError::Protocol(format!(
                    "Unexpected {} on established tunnel {}",
                    other, tunnel_id
                )));
            }
        }
    }
}

fn is_open_marker(msg: &ProtoMessage) -> bool {
    msg.body.is_empty() && msg.transfer_flags() == TransferFlags::new()
}

/// Bind `session_id` to a new local connection
///
/// The pipe is stored before connecting so TRANSFER frames that arrive while
/// the connect is in flight are queued, not dropped.
async fn open_session(tunnel: &Arc<LocalTunnel>, session_id: i64) {
    let (pipe, inbox) = SessionPipe::new();
    match tunnel.sessions.insert(session_id, pipe).await {
        Ok(Some(stale)) => {
            warn!("Session {}/{} reopened", tunnel.tunnel_id, session_id);
            stale.close();
        }
        Ok(None) => {}
        Err(e) => {
            debug!("{}", e);
            return;
        }
    }

    let tunnel = tunnel.clone();
    tokio::spawn(async move {
        let link = tunnel.link(session_id);
        let target = tunnel.request.local_target();
        let cancel = inbox.cancel_token();

        let stream = tokio::select! {
            _ = cancel.cancelled() => None,
            connected = TcpStream::connect(&target) => match connected {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(
                        "Session {}/{}: cannot reach local service {}: {}",
                        tunnel.tunnel_id, session_id, target, e
                    );
                    None
                }
            },
        };

        let Some(stream) = stream else {
            tunnel.sessions.remove(session_id).await;
            link.send_disconnect().await;
            return;
        };

        let _ = stream.set_nodelay(true);
        debug!("Session {}/{} connected to {}", tunnel.tunnel_id, session_id, target);
        if tunnel
            .control
            .send(ProtoMessage::local_connected(tunnel.tunnel_id, session_id))
            .await
            .is_err()
        {
            tunnel.sessions.remove(session_id).await;
            return;
        }

        if pump(stream, inbox, &link, &tunnel.meter).await == PumpEnd::SocketClosed {
            link.send_disconnect().await;
        }
        tunnel.sessions.remove(session_id).await;
        trace!("Session {}/{} finished", tunnel.tunnel_id, session_id);
    });
}
