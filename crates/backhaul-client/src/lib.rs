//! NAT-side half of backhaul
//!
//! A [`TunnelClient`] keeps one control connection per tunnel open to the
//! server. Sessions the server opens over it are bound to fresh connections to
//! the tunnel's local service.
//!
//! ```ignore
//! use backhaul_client::{ClientOptions, TunnelClient};
//! use backhaul_proto::TunnelRequest;
//!
//! let client = TunnelClient::new(ClientOptions::default());
//! let ssh = client.connect("relay.example.com:7000", TunnelRequest::tcp("127.0.0.1", 22, 0), true);
//! let granted = ssh.wait_established().await?;
//! println!("ssh reachable on port {}", granted.remote_port);
//! ```

mod client;
pub mod config;
mod connection;
pub mod error;
mod handshake;
pub mod listener;
pub mod options;
mod tunnel;

pub use client::TunnelClient;
pub use config::{ClientConfig, ConfigError, TunnelDefinition};
pub use connection::{ConnectionSnapshot, ConnectionState, ConnectionStatus, TunnelConnection};
pub use error::{ErrorKind, TunnelError};
pub use listener::{ConnectionListener, DisconnectCallback, RequestCallback};
pub use options::{ClientOptions, RetryPolicy};
