//! Per-tunnel session table
//!
//! Maps session ids to the handle that owns the session's socket: the public
//! socket on the server, the local socket on the client.

use crate::channel::{ChannelError, ControlSender};
use backhaul_proto::ProtoMessage;
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Events buffered per session before the control reader waits on it
pub const SESSION_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session table of tunnel {0} is disposed")]
    Disposed(i64),
}

/// Something the table can close when the tunnel goes away
pub trait SessionHandle: Clone + Send + Sync {
    fn close(&self);
}

struct Sessions<H> {
    next_id: i64,
    map: HashMap<i64, H>,
    disposed: bool,
}

pub struct SessionTable<H> {
    tunnel_id: i64,
    control: ControlSender,
    inner: RwLock<Sessions<H>>,
}

impl<H: SessionHandle> SessionTable<H> {
    pub fn new(tunnel_id: i64, control: ControlSender) -> Self {
        Self {
            tunnel_id,
            control,
            inner: RwLock::new(Sessions {
                next_id: 1,
                map: HashMap::new(),
                disposed: false,
            }),
        }
    }

    pub fn tunnel_id(&self) -> i64 {
        self.tunnel_id
    }

    pub fn control(&self) -> &ControlSender {
        &self.control
    }

    /// Store `handle` under the next session id
    pub async fn put(&self, handle: H) -> Result<i64, SessionError> {
        let mut inner = self.inner.write().await;
        if inner.disposed {
            return Err(SessionError::Disposed(self.tunnel_id));
        }

        let session_id = inner.next_id;
        inner.next_id = session_id.checked_add(1).unwrap_or(1);
        inner.map.insert(session_id, handle);
        Ok(session_id)
    }

    /// Bind a peer-allocated session id; returns the handle it replaced
    pub async fn insert(&self, session_id: i64, handle: H) -> Result<Option<H>, SessionError> {
        let mut inner = self.inner.write().await;
        if inner.disposed {
            return Err(SessionError::Disposed(self.tunnel_id));
        }
        Ok(inner.map.insert(session_id, handle))
    }

    pub async fn get(&self, session_id: i64) -> Option<H> {
        self.inner.read().await.map.get(&session_id).cloned()
    }

    pub async fn remove(&self, session_id: i64) -> Option<H> {
        self.inner.write().await.map.remove(&session_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tell the peer on the owning control channel to drop this tunnel
    ///
    /// Does not wait for room on the channel.
    pub fn force_off(&self) -> Result<(), ChannelError> {
        self.control.try_send(ProtoMessage::force_off(self.tunnel_id))
    }

    /// Close and forget every session; later `put`/`insert` calls fail
    pub async fn dispose(&self) {
        let drained: Vec<H> = {
            let mut inner = self.inner.write().await;
            inner.disposed = true;
            inner.map.drain().map(|(_, handle)| handle).collect()
        };

        if !drained.is_empty() {
            debug!(
                "Disposing {} session(s) of tunnel {}",
                drained.len(),
                self.tunnel_id
            );
        }
        for handle in drained {
            handle.close();
        }
    }
}

/// Event delivered to the task owning a session socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer confirmed its end of the session is connected
    Connected,
    Data(Bytes),
}

/// Table-side handle of one session
///
/// The queue is bounded, so a socket that is not draining pauses whoever
/// delivers to it.
#[derive(Clone, Debug)]
pub struct SessionPipe {
    tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

/// Socket-side end of a [`SessionPipe`]
#[derive(Debug)]
pub struct SessionInbox {
    rx: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

impl SessionPipe {
    pub fn new() -> (Self, SessionInbox) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        (
            Self {
                tx,
                cancel: cancel.clone(),
            },
            SessionInbox { rx, cancel },
        )
    }

    /// Queue `data` for the socket, waiting for room
    ///
    /// Returns false if the session is already gone.
    pub async fn deliver(&self, data: Bytes) -> bool {
        self.push(SessionEvent::Data(data)).await
    }

    pub async fn mark_connected(&self) -> bool {
        self.push(SessionEvent::Connected).await
    }

    async fn push(&self, event: SessionEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl SessionHandle for SessionPipe {
    fn close(&self) {
        self.cancel.cancel();
    }
}

impl SessionInbox {
    /// Next event, or `None` once the session is closed
    ///
    /// Events delivered before the close are still returned.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        tokio::select! {
            biased;
            event = self.rx.recv() => event,
            _ = self.cancel.cancelled() => None,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
