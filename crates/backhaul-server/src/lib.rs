//! Public-facing side of backhaul
//!
//! A [`TunnelServer`] accepts control connections from clients, admits tunnel
//! requests through its [`TunnelRequestInterceptor`] chain and registers them:
//! TCP tunnels get their own public port, HTTP/HTTPS tunnels share one
//! listener per scheme and are selected by the `Host` header.
//!
//! ```ignore
//! use backhaul_server::{ServerConfig, TunnelServer};
//!
//! let server = TunnelServer::new(ServerConfig {
//!     http_addr: Some("0.0.0.0:8080".parse()?),
//!     auth_token: Some("tok1".to_string()),
//!     ..ServerConfig::default()
//! });
//! let addrs = server.start().await?;
//! ```

pub mod config;
mod dispatch;
pub mod error;
mod handler;
pub mod http;
pub mod interceptor;
pub mod listener;
mod server;
mod tcp;

pub use config::{ServerConfig, TlsFiles};
pub use error::{AdmissionError, ServerError};
pub use http::HttpRequestHead;
pub use interceptor::{
    BasicAuthInterceptor, DefaultTunnelRequestInterceptor, HeaderRulesInterceptor,
    HttpRequestInterceptor, TunnelRequestInterceptor,
};
pub use listener::{ServerListeners, TunnelCallback, TunnelStateListener};
pub use server::{ServerAddrs, TunnelServer};
