//! Connection plumbing shared by the backhaul server and client
//!
//! - [`transport`]: TCP/TLS byte streams for the control connection
//! - [`channel`]: framed control channel with a single writer task
//! - [`heartbeat`]: reader/writer idle detection
//! - [`forward`]: byte pump between a session socket and the channel
//! - [`session`]: per-tunnel session tables
//! - [`sealing`]: TRANSFER payload compression and encryption
//! - [`traffic`]: byte counters and traffic observers
//! - [`reconnect`]: exponential backoff

pub mod channel;
pub mod forward;
pub mod heartbeat;
pub mod reconnect;
pub mod sealing;
pub mod session;
pub mod tls;
pub mod traffic;
pub mod transport;

pub use channel::{ChannelError, ControlChannel, ControlSender, CONTROL_QUEUE_CAPACITY};
pub use forward::{pump, PumpEnd, SessionLink, Side};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatSettings, IdleAction, IdleCallback, IdleEvent, IdleMonitor,
};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use sealing::PayloadCodec;
pub use session::{
    SessionError, SessionEvent, SessionHandle, SessionInbox, SessionPipe, SessionTable,
    SESSION_QUEUE_CAPACITY,
};
pub use tls::{server_acceptor, TlsClientSettings};
pub use traffic::{TrafficListener, TrafficMeter, TrafficSnapshot, TrafficStats};
pub use transport::{connect, AsyncStream, BoxedStream, TransportError};
