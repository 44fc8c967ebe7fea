//! Server half of the handshake and the per-tunnel control loop

use crate::error::AdmissionError;
use crate::server::ServerContext;
use crate::tcp::serve_tcp_tunnel;
use backhaul_connection::{
    BoxedStream, ChannelError, ControlChannel, ControlSender, PayloadCodec, SessionHandle,
    TrafficMeter,
};
use backhaul_crypto::{decompress, wrap_aes_key, AesKey, CryptoError};
use backhaul_proto::{Command, FrameCodec, ProtoMessage, TunnelRequest, TunnelType};
use backhaul_router::{TunnelDescriptor, VhostKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PUBLIC_KEY_SIZE: usize = 64 * 1024;
/// Tries for an automatic port when another tunnel wins the race for it
const PORT_ALLOCATION_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
enum HandshakeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Key exchange failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Peer closed the connection")]
    Closed,

    #[error("Expected {expected}, got {got}")]
    Unexpected { expected: Command, got: Command },

    #[error("Handshake timed out")]
    Timeout,

    #[error("Rejected: {0}")]
    Admission(#[from] AdmissionError),
}

enum SlotKey {
    Port(u16),
    Vhost(VhostKey),
}

/// A registered tunnel owned by one control connection
struct Admitted {
    descriptor: Arc<TunnelDescriptor>,
    slot: SlotKey,
    listener: Option<TcpListener>,
}

/// Accept control connections until the server shuts down
pub(crate) async fn serve_control(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    ctx: Arc<ServerContext>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("Control listener on {} (tls: {})", addr, acceptor.is_some());
    }

    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                    continue;
                }
            },
        };

        let _ = socket.set_nodelay(true);
        debug!("Control connection from {}", peer_addr);
        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let stream: BoxedStream = match acceptor {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(tls) => Box::new(tls),
                    Err(e) => {
                        debug!("TLS handshake with {} failed: {}", peer_addr, e);
                        return;
                    }
                },
                None => Box::new(socket),
            };
            handle_control(stream, peer_addr, ctx).await;
        });
    }

    debug!("Control listener stopped");
}

/// Drive one control connection from HANDSHAKE to close
pub(crate) async fn handle_control(stream: BoxedStream, peer_addr: SocketAddr, ctx: Arc<ServerContext>) {
    let codec = FrameCodec::with_max_frame_size(ctx.config.max_frame_size);
    let mut channel = ControlChannel::new(stream, codec, ctx.config.heartbeat.into());

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let (request, payload) = negotiate(&mut channel, &ctx).await?;
        let admitted = admit(&ctx, request, channel.sender(), payload, peer_addr).await?;
        Ok::<_, HandshakeError>(admitted)
    })
    .await
    .unwrap_or(Err(HandshakeError::Timeout));

    let mut admitted = match handshake {
        Ok(admitted) => admitted,
        Err(HandshakeError::Admission(reason)) => {
            info!("Rejected tunnel request from {}: {}", peer_addr, reason);
            let _ = channel
                .send(ProtoMessage::response_rejected(&reason.to_string()))
                .await;
            channel.close();
            return;
        }
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer_addr, e);
            return;
        }
    };

    let tunnel_id = admitted.descriptor.tunnel_id();
    let request = admitted.descriptor.request().clone();

    let response = match request.to_json() {
        Ok(body) => ProtoMessage::response_ok(tunnel_id, body),
        Err(e) => {
            error!("Failed to encode tunnel request: {}", e);
            release(&ctx, &admitted).await;
            return;
        }
    };
    if let Err(e) = channel.send(response).await {
        debug!("Tunnel {} lost before it was confirmed: {}", tunnel_id, e);
        release(&ctx, &admitted).await;
        return;
    }

    info!("Tunnel {} established from {}: {}", tunnel_id, peer_addr, request);
    ctx.listeners.for_type(request.tunnel_type).notify_bind(&request);

    if let Some(listener) = admitted.listener.take() {
        tokio::spawn(serve_tcp_tunnel(listener, admitted.descriptor.clone()));
    }

    control_loop(&mut channel, &admitted.descriptor).await;
    channel.close();

    release(&ctx, &admitted).await;
    ctx.listeners.for_type(request.tunnel_type).notify_unbind(&request);
    info!("Tunnel {} closed ({})", tunnel_id, request);
}

/// HANDSHAKE then REQUEST
async fn negotiate(
    channel: &mut ControlChannel,
    ctx: &ServerContext,
) -> Result<(TunnelRequest, PayloadCodec), HandshakeError> {
    let hello = expect(channel, Command::Handshake).await?;
    let flags = hello.handshake_flags();

    let key = if flags.has_encrypt() {
        let public_key = if flags.has_key_compressed() {
            decompress(&hello.body, MAX_PUBLIC_KEY_SIZE)?
        } else {
            hello.body.to_vec()
        };
        let key = AesKey::generate();
        let wrapped = wrap_aes_key(&public_key, &key)?;
        channel.send(ProtoMessage::response_ok(0, wrapped)).await?;
        Some(key)
    } else {
        channel.send(ProtoMessage::response_ok(0, Vec::new())).await?;
        None
    };
    trace!(
        "Handshake flags {:#04x}, encrypted: {}",
        flags.as_u8(),
        key.is_some()
    );

    let payload = PayloadCodec::new(key, flags.has_compress_payload())
        .with_max_payload(ctx.config.max_frame_size);

    let msg = expect(channel, Command::Request).await?;
    let request = TunnelRequest::from_json(&msg.body)
        .map_err(|e| AdmissionError::Malformed(e.to_string()))?;
    Ok((request, payload))
}

async fn expect(channel: &mut ControlChannel, command: Command) -> Result<ProtoMessage, HandshakeError> {
    match channel.recv().await? {
        Some(msg) if msg.command == command => Ok(msg),
        Some(msg) => Err(HandshakeError::Unexpected {
            expected: command,
            got: msg.command,
        }),
        None => Err(HandshakeError::Closed),
    }
}

/// Run the interceptors and take the registry slot
async fn admit(
    ctx: &Arc<ServerContext>,
    request: TunnelRequest,
    control: ControlSender,
    payload: PayloadCodec,
    peer_addr: SocketAddr,
) -> Result<Admitted, AdmissionError> {
    let auto_port = request.tunnel_type == TunnelType::Tcp && request.remote_port == 0;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let admitted = intercept_blocking(ctx, request.clone()).await?;
        match register(ctx, admitted, control.clone(), payload.clone(), peer_addr).await {
            Err(AdmissionError::AlreadyRegistered(slot))
                if auto_port && attempt < PORT_ALLOCATION_ATTEMPTS =>
            {
                debug!("Allocated {} was taken meanwhile, retrying", slot);
            }
            result => return result,
        }
    }
}

/// Interceptors may block (port probing, user hooks), so they run on the
/// blocking pool
async fn intercept_blocking(
    ctx: &Arc<ServerContext>,
    request: TunnelRequest,
) -> Result<TunnelRequest, AdmissionError> {
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || ctx.intercept(request))
        .await
        .map_err(|e| AdmissionError::Rejected(format!("admission aborted: {}", e)))?
}

async fn register(
    ctx: &ServerContext,
    request: TunnelRequest,
    control: ControlSender,
    payload: PayloadCodec,
    peer_addr: SocketAddr,
) -> Result<Admitted, AdmissionError> {
    let tunnel_id = ctx.next_tunnel_id();
    let request = Arc::new(request);
    let meter = TrafficMeter::new(request.clone(), ctx.listeners.traffic.clone());
    let descriptor = Arc::new(
        TunnelDescriptor::new(tunnel_id, request.clone(), control, meter, peer_addr)
            .with_payload(payload),
    );

    match request.tunnel_type {
        TunnelType::Tcp => {
            let port = request.remote_port;
            let port_taken = || AdmissionError::AlreadyRegistered(format!("port {}", port));

            ctx.tcp
                .register(port, descriptor.clone())
                .map_err(|_| port_taken())?;

            let bind_addr = SocketAddr::new(ctx.tcp.bind_host(), port);
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => Ok(Admitted {
                    descriptor,
                    slot: SlotKey::Port(port),
                    listener: Some(listener),
                }),
                Err(e) => {
                    warn!("Failed to bind {}: {}", bind_addr, e);
                    ctx.tcp.unregister_owned(&port, tunnel_id).await;
                    Err(port_taken())
                }
            }
        }
        TunnelType::Http | TunnelType::Https => {
            let host = request
                .normalized_vhost()
                .ok_or(AdmissionError::MissingVirtualHost)?;
            let key = VhostKey::new(&host, request.tunnel_type == TunnelType::Https);
            ctx.vhosts.register(key.clone(), descriptor.clone())?;
            Ok(Admitted {
                descriptor,
                slot: SlotKey::Vhost(key),
                listener: None,
            })
        }
        TunnelType::Unknown => Err(AdmissionError::UnknownTunnelType),
    }
}

/// Give the slot back unless someone else owns it by now
async fn release(ctx: &ServerContext, admitted: &Admitted) {
    let tunnel_id = admitted.descriptor.tunnel_id();
    let removed = match &admitted.slot {
        SlotKey::Port(port) => ctx.tcp.unregister_owned(port, tunnel_id).await,
        SlotKey::Vhost(key) => ctx.vhosts.unregister_owned(key, tunnel_id).await,
    };
    if !removed {
        admitted.descriptor.teardown().await;
    }
}

/// Route session frames until the connection or the tunnel goes away
async fn control_loop(channel: &mut ControlChannel, descriptor: &TunnelDescriptor) {
    let tunnel_id = descriptor.tunnel_id();
    let sessions = descriptor.sessions();
    let shutdown = descriptor.shutdown_token();

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Tunnel {} torn down", tunnel_id);
                break;
            }
            received = channel.recv() => match received {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("Control connection of tunnel {} closed", tunnel_id);
                    break;
                }
                Err(e) => {
                    warn!("Control connection of tunnel {} failed: {}", tunnel_id, e);
                    break;
                }
            },
        };

        match msg.command {
            Command::LocalConnected => {
                if let Some(pipe) = sessions.get(msg.session_id).await {
                    pipe.mark_connected().await;
                }
            }
            Command::LocalDisconnect => {
                if let Some(pipe) = sessions.remove(msg.session_id).await {
                    trace!("Session {}/{} closed by client", tunnel_id, msg.session_id);
                    pipe.close();
                }
            }
            Command::Transfer => {
                let data = match descriptor.payload().open(msg.transfer_flags(), msg.body) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Tunnel {}: undecodable payload: {}", tunnel_id, e);
                        break;
                    }
                };
                match sessions.get(msg.session_id).await {
                    // Waits while the public socket is backed up
                    Some(pipe) => tokio::select! {
                        _ = pipe.deliver(data) => {}
                        _ = shutdown.cancelled() => break,
                        _ = descriptor.control().closed() => break,
                    },
                    None => trace!(
                        "Dropping {} bytes for unknown session {}/{}",
                        data.len(),
                        tunnel_id,
                        msg.session_id
                    ),
                }
            }
            other => {
                warn!("Tunnel {}: unexpected {} on established connection", tunnel_id, other);
                break;
            }
        }
    }
}
