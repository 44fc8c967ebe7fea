//! Byte pump between one session socket and the control channel

use crate::channel::ControlSender;
use crate::sealing::PayloadCodec;
use crate::session::{SessionEvent, SessionInbox};
use crate::traffic::TrafficMeter;
use backhaul_proto::ProtoMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Which end of the tunnel the socket is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Public socket on the server; reads are inbound traffic
    Public,
    /// Local service socket on the client; reads are outbound traffic
    Local,
}

/// Identity of one session on a control channel
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub tunnel_id: i64,
    pub session_id: i64,
    pub control: ControlSender,
    pub payload: PayloadCodec,
    pub side: Side,
}

impl SessionLink {
    /// Seal and queue `data` as a TRANSFER frame, waiting while the control
    /// channel is backed up
    pub async fn send_data(&self, data: &[u8]) -> bool {
        let msg = match self.payload.transfer(self.tunnel_id, self.session_id, data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "Failed to seal payload for session {}/{}: {}",
                    self.tunnel_id, self.session_id, e
                );
                return false;
            }
        };
        self.control.send(msg).await.is_ok()
    }

    pub async fn send_disconnect(&self) {
        let _ = self
            .control
            .send(ProtoMessage::local_disconnect(self.tunnel_id, self.session_id))
            .await;
    }
}

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The socket closed or failed; the peer has not been told yet
    SocketClosed,
    /// The session was closed from the tunnel side
    PeerClosed,
}

/// Relay bytes until either end closes
///
/// Socket reads become TRANSFER frames; data events from `inbox` are written
/// to the socket. The two directions run independently, and each one stops
/// reading while its destination is backed up. Closing is full-close in both
/// directions.
pub async fn pump<S>(stream: S, mut inbox: SessionInbox, link: &SessionLink, meter: &TrafficMeter) -> PumpEnd
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let upstream = async {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return PumpEnd::SocketClosed,
                Ok(n) => {
                    trace!("Session {}/{}: read {} bytes", link.tunnel_id, link.session_id, n);
                    match link.side {
                        Side::Public => meter.inbound(n),
                        Side::Local => meter.outbound(n),
                    }
                    if !link.send_data(&buf[..n]).await {
                        return PumpEnd::PeerClosed;
                    }
                }
                Err(e) => {
                    debug!("Session {}/{} read error: {}", link.tunnel_id, link.session_id, e);
                    return PumpEnd::SocketClosed;
                }
            }
        }
    };

    let downstream = async {
        loop {
            match inbox.recv().await {
                Some(SessionEvent::Data(data)) => {
                    if let Err(e) = writer.write_all(&data).await {
                        debug!("Session {}/{} write error: {}", link.tunnel_id, link.session_id, e);
                        return PumpEnd::SocketClosed;
                    }
                    match link.side {
                        Side::Public => meter.outbound(data.len()),
                        Side::Local => meter.inbound(data.len()),
                    }
                }
                Some(SessionEvent::Connected) => {}
                None => return PumpEnd::PeerClosed,
            }
        }
    };

    let end = tokio::select! {
        end = upstream => end,
        end = downstream => end,
    };

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionPipe;
    use crate::traffic::TrafficListener;
    use backhaul_proto::{Command, TunnelRequest};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn link(control: ControlSender, side: Side) -> SessionLink {
        SessionLink {
            tunnel_id: 1,
            session_id: 2,
            control,
            payload: PayloadCodec::plain(),
            side,
        }
    }

    fn meter() -> TrafficMeter {
        TrafficMeter::new(
            Arc::new(TunnelRequest::tcp("127.0.0.1", 22, 0)),
            TrafficListener::default(),
        )
    }

    #[tokio::test]
    async fn test_socket_reads_become_transfers() {
        let (control, mut frames) = ControlSender::detached(8);
        let (pipe, inbox) = SessionPipe::new();
        let (mut user, socket) = tokio::io::duplex(1024);
        let meter = meter();

        let link = link(control, Side::Public);
        let pump_meter = meter.clone();
        let task = tokio::spawn(async move { pump(socket, inbox, &link, &pump_meter).await });

        user.write_all(b"hello").await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.command, Command::Transfer);
        assert_eq!((frame.tunnel_id, frame.session_id), (1, 2));
        assert_eq!(&frame.body[..], b"hello");

        assert!(pipe.deliver(Bytes::from_static(b"world")).await);
        let mut reply = [0u8; 5];
        user.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");

        drop(user);
        assert_eq!(task.await.unwrap(), PumpEnd::SocketClosed);
        assert_eq!(meter.stats().inbound_bytes(), 5);
        assert_eq!(meter.stats().outbound_bytes(), 5);
    }

    #[tokio::test]
    async fn test_peer_close_flushes_and_shuts_socket() {
        let (control, _frames) = ControlSender::detached(8);
        let (pipe, inbox) = SessionPipe::new();
        let (mut user, socket) = tokio::io::duplex(1024);
        let meter = meter();

        let link = link(control, Side::Local);
        let task = tokio::spawn(async move { pump(socket, inbox, &link, &meter).await });

        assert!(pipe.deliver(Bytes::from_static(b"bye")).await);
        crate::session::SessionHandle::close(&pipe);

        let mut received = Vec::new();
        user.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
        assert_eq!(task.await.unwrap(), PumpEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_stalled_control_pauses_socket_reads() {
        let (control, mut frames) = ControlSender::detached(2);
        let (pipe, inbox) = SessionPipe::new();
        let (mut user, socket) = tokio::io::duplex(4096);
        let meter = meter();

        let link = link(control, Side::Public);
        let pump_meter = meter.clone();
        let task = tokio::spawn(async move { pump(socket, inbox, &link, &pump_meter).await });

        // Nothing drains `frames`, so the writer must stall well short of 1 MiB
        let payload = vec![7u8; 1024 * 1024];
        let written = tokio::time::timeout(Duration::from_millis(300), user.write_all(&payload)).await;
        assert!(written.is_err(), "socket reads should pause behind a full control queue");

        let mut queued = 0;
        while frames.try_recv().is_ok() {
            queued += 1;
        }
        assert!(queued <= 3, "queued {} frames", queued);

        // The other direction still flows while uploads are stalled
        assert!(pipe.deliver(Bytes::from_static(b"still here")).await);
        let mut reply = [0u8; 10];
        user.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"still here");

        crate::session::SessionHandle::close(&pipe);
        assert_eq!(task.await.unwrap(), PumpEnd::PeerClosed);
    }
}
