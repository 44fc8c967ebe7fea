//! Public connection -> session plumbing shared by the TCP and HTTP listeners

use backhaul_connection::{pump, PumpEnd, SessionEvent, SessionInbox, SessionLink, SessionPipe, Side};
use backhaul_proto::ProtoMessage;
use backhaul_router::TunnelDescriptor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// A session whose local end the client confirmed with LOCAL_CONNECTED
pub(crate) struct PublicSession {
    descriptor: Arc<TunnelDescriptor>,
    link: SessionLink,
    inbox: SessionInbox,
}

impl PublicSession {
    pub(crate) fn session_id(&self) -> i64 {
        self.link.session_id
    }
}

/// Allocate a session, announce it to the client and wait for the local side
///
/// Returns `None` if the tunnel is gone or the client could not reach its
/// local service.
pub(crate) async fn open_session(descriptor: &Arc<TunnelDescriptor>) -> Option<PublicSession> {
    let tunnel_id = descriptor.tunnel_id();
    let sessions = descriptor.sessions();

    let (pipe, mut inbox) = SessionPipe::new();
    let session_id = match sessions.put(pipe).await {
        Ok(id) => id,
        Err(e) => {
            debug!("Cannot open session: {}", e);
            return None;
        }
    };

    if descriptor
        .control()
        .send(ProtoMessage::session_open(tunnel_id, session_id))
        .await
        .is_err()
    {
        sessions.remove(session_id).await;
        return None;
    }

    loop {
        match inbox.recv().await {
            Some(SessionEvent::Connected) => break,
            Some(SessionEvent::Data(data)) => {
                trace!(
                    "Session {}/{}: ignoring {} bytes before LOCAL_CONNECTED",
                    tunnel_id,
                    session_id,
                    data.len()
                );
            }
            None => {
                debug!("Session {}/{}: local service unreachable", tunnel_id, session_id);
                sessions.remove(session_id).await;
                return None;
            }
        }
    }

    let link = SessionLink {
        tunnel_id,
        session_id,
        control: descriptor.control().clone(),
        payload: descriptor.payload().clone(),
        side: Side::Public,
    };
    Some(PublicSession {
        descriptor: descriptor.clone(),
        link,
        inbox,
    })
}

/// Relay between the public socket and the tunnel until either side closes
///
/// `initial` is sent ahead of anything read from `stream` (e.g. an already
/// parsed HTTP head).
pub(crate) async fn forward<S>(stream: S, session: PublicSession, initial: Option<Vec<u8>>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let PublicSession {
        descriptor,
        link,
        inbox,
    } = session;
    let meter = descriptor.meter();

    if let Some(initial) = initial {
        meter.inbound(initial.len());
        if !link.send_data(&initial).await {
            descriptor.sessions().remove(link.session_id).await;
            return;
        }
    }

    if pump(stream, inbox, &link, meter).await == PumpEnd::SocketClosed {
        link.send_disconnect().await;
    }
    descriptor.sessions().remove(link.session_id).await;
    trace!("Session {}/{} finished", link.tunnel_id, link.session_id);
}
