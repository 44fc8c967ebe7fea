//! Public listener of one TCP tunnel

use crate::dispatch::{forward, open_session};
use backhaul_router::TunnelDescriptor;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Accept public connections until the tunnel is torn down
pub(crate) async fn serve_tcp_tunnel(listener: TcpListener, descriptor: Arc<TunnelDescriptor>) {
    let shutdown = descriptor.shutdown_token();
    let tunnel_id = descriptor.tunnel_id();
    let local_addr = listener.local_addr().ok();

    info!(
        "Tunnel {} listening on {:?} -> {}",
        tunnel_id,
        local_addr,
        descriptor.request().local_target()
    );

    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Tunnel {}: failed to accept connection: {}", tunnel_id, e);
                    continue;
                }
            },
        };

        let _ = socket.set_nodelay(true);
        let descriptor = descriptor.clone();
        tokio::spawn(async move {
            match open_session(&descriptor).await {
                Some(session) => {
                    debug!(
                        "Tunnel {}: session {} for {}",
                        tunnel_id,
                        session.session_id(),
                        peer_addr
                    );
                    forward(socket, session, None).await;
                }
                None => debug!("Tunnel {}: dropping connection from {}", tunnel_id, peer_addr),
            }
        });
    }

    debug!("Tunnel {} stopped listening on {:?}", tunnel_id, local_addr);
}
