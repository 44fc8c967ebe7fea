//! Framed control channel
//!
//! Reads happen on the task that owns [`ControlChannel`]; all writes are
//! queued through cloneable [`ControlSender`]s and flushed by one writer task,
//! so frames from different sessions never interleave mid-frame and each
//! session's frames keep their enqueue order. The queue is bounded: senders
//! wait while the socket is not draining.

use crate::heartbeat::{ActivityClock, HeartbeatConfig, IdleAction, IdleCallback, IdleEvent, IdleMonitor};
use crate::transport::BoxedStream;
use backhaul_proto::{CodecError, Command, FrameCodec, ProtoMessage};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Frames queued per control connection before senders wait
pub const CONTROL_QUEUE_CAPACITY: usize = 128;

/// How long a closing channel may spend writing what was already queued
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Control channel closed")]
    Closed,

    #[error("Control channel queue is full")]
    Full,

    #[error("No traffic from peer for {0:?}")]
    IdleTimeout(Duration),
}

/// Write handle of a control channel
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<ProtoMessage>,
    shutdown: CancellationToken,
}

impl ControlSender {
    /// Queue a frame, waiting for room; fails once the channel is closed
    pub async fn send(&self, msg: ProtoMessage) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(ChannelError::Closed),
            sent = self.tx.send(msg) => sent.map_err(|_| ChannelError::Closed),
        }
    }

    /// Queue a frame only if there is room right now
    pub fn try_send(&self, msg: ProtoMessage) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    /// Close the channel; frames queued before this call are still flushed
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// A sender not bound to any socket; frames land in the returned receiver
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<ProtoMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                shutdown: CancellationToken::new(),
            },
            rx,
        )
    }
}

impl std::fmt::Debug for ControlSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read side of a control connection plus its heartbeat
///
/// Dropping the channel closes the connection.
pub struct ControlChannel {
    reader: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    sender: ControlSender,
    monitor: IdleMonitor,
    on_reader_idle: Option<IdleCallback>,
}

impl ControlChannel {
    pub fn new(stream: BoxedStream, codec: FrameCodec, heartbeat: HeartbeatConfig) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        let writes = Arc::new(ActivityClock::new());

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, codec),
            rx,
            shutdown.clone(),
            writes.clone(),
        ));

        Self {
            reader: FramedRead::new(read_half, codec),
            sender: ControlSender { tx, shutdown },
            monitor: IdleMonitor::new(heartbeat, writes),
            on_reader_idle: None,
        }
    }

    /// Replace the default reader-idle behaviour (close)
    pub fn with_idle_callback(mut self, callback: IdleCallback) -> Self {
        self.on_reader_idle = Some(callback);
        self
    }

    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    pub async fn send(&self, msg: ProtoMessage) -> Result<(), ChannelError> {
        self.sender.send(msg).await
    }

    /// Next non-PING frame
    ///
    /// `Ok(None)` means the peer closed the stream or the channel was closed
    /// locally. Heartbeats are handled here: PINGs are sent when the writer
    /// idles and swallowed when received.
    pub async fn recv(&mut self) -> Result<Option<ProtoMessage>, ChannelError> {
        loop {
            tokio::select! {
                biased;
                _ = self.sender.shutdown.cancelled() => return Ok(None),
                frame = self.reader.next() => {
                    let msg = match frame {
                        None => return Ok(None),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(msg)) => msg,
                    };
                    self.monitor.record_read();
                    if msg.command == Command::Ping {
                        trace!("PING received");
                        continue;
                    }
                    return Ok(Some(msg));
                }
                event = self.monitor.next_idle() => match event {
                    IdleEvent::WriterIdle => {
                        trace!("Writer idle, sending PING");
                        let _ = self.sender.try_send(ProtoMessage::ping());
                    }
                    IdleEvent::ReaderIdle => {
                        let action = self
                            .on_reader_idle
                            .as_ref()
                            .map(|callback| callback())
                            .unwrap_or(IdleAction::Close);
                        if action == IdleAction::Close {
                            let window = self.monitor.config().reader_idle.unwrap_or_default();
                            debug!("Peer idle for {:?}, closing control channel", window);
                            return Err(ChannelError::IdleTimeout(window));
                        }
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.sender.close();
    }
}

async fn write_loop(
    mut framed: FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    mut rx: mpsc::Receiver<ProtoMessage>,
    shutdown: CancellationToken,
    writes: Arc<ActivityClock>,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write_batch(&mut framed, msg, &mut rx).await {
                    warn!("Control channel write failed: {}", e);
                    break;
                }
                writes.touch();
            }
            _ = shutdown.cancelled() => break,
        }
    }

    shutdown.cancel();
    rx.close();
    let drain = async {
        while let Ok(msg) = rx.try_recv() {
            framed.feed(msg).await?;
        }
        framed.close().await
    };
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!("Control channel shutdown: {}", e),
        Err(_) => debug!("Peer stopped reading, dropping queued frames"),
    }
}

/// Feed everything already queued, then flush once
async fn write_batch(
    framed: &mut FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    first: ProtoMessage,
    rx: &mut mpsc::Receiver<ProtoMessage>,
) -> Result<(), CodecError> {
    framed.feed(first).await?;
    while let Ok(msg) = rx.try_recv() {
        framed.feed(msg).await?;
    }
    framed.flush().await
}
