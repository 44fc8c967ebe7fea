//! backhaul - reverse tunnels for services behind NAT
//!
//! This crate re-exports the backhaul crates as one entry point, for
//! applications that embed a relay server, a tunnel client, or both.
//!
//! # Tunnel client
//!
//! ```ignore
//! use backhaul_lib::{ClientOptions, TunnelClient, TunnelRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = TunnelClient::new(ClientOptions::default());
//!     let web = client.connect(
//!         "relay.example.com:7000",
//!         TunnelRequest::http("127.0.0.1", 3000, "app.example.com"),
//!         true,
//!     );
//!
//!     let granted = web.wait_established().await?;
//!     println!("Serving {}", granted);
//!     web.closed().await;
//!     Ok(())
//! }
//! ```
//!
//! # Relay server
//!
//! ```ignore
//! use backhaul_lib::{ServerConfig, TunnelServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = TunnelServer::new(ServerConfig {
//!     http_addr: Some("0.0.0.0:8080".parse()?),
//!     auth_token: Some(std::env::var("BACKHAUL_TOKEN")?),
//!     ..ServerConfig::default()
//! })
//! .with_interceptor(|request: backhaul_lib::TunnelRequest| {
//!     // Extra admission policy runs after the built-in checks
//!     Ok(request)
//! });
//!
//! let addrs = server.start().await?;
//! println!("Control port {}", addrs.control);
//! # Ok(())
//! # }
//! ```

// Wire format and tunnel requests
pub use backhaul_proto::{
    extras, normalize_host, BasicAuthConfig, CodecError, Command, FrameCodec, HandshakeFlags,
    ProtoMessage, ResponseStatus, TransferFlags, TunnelRequest, TunnelType, FRAME_FIXED_SIZE,
    MAX_FRAME_SIZE,
};

// Key exchange, payload encryption and compression
pub use backhaul_crypto::{
    decrypt_aes128, encrypt_aes128, try_compress, AesKey, CryptoError, KeyPair,
    COMPRESSION_THRESHOLD, DEFAULT_RSA_BITS,
};

// Control channel, heartbeat, sessions and traffic accounting
pub use backhaul_connection::{
    ChannelError, ControlChannel, ControlSender, HeartbeatConfig, HeartbeatSettings,
    PayloadCodec, ReconnectConfig, SessionTable, TlsClientSettings, TrafficListener,
    TrafficSnapshot, TrafficStats, TransportError,
};

// Registries
pub use backhaul_router::{
    PortRange, RegistryError, TcpRegistry, TunnelDescriptor, TunnelSnapshot, VhostKey,
    VhostRegistry,
};

// HTTP Basic-Auth
pub use backhaul_http_auth::{AuthResult, BasicAuthProvider, HttpAuthProvider, HttpAuthenticator};

// Server
pub use backhaul_server::{
    AdmissionError, BasicAuthInterceptor, DefaultTunnelRequestInterceptor,
    HeaderRulesInterceptor, HttpRequestHead, HttpRequestInterceptor, ServerAddrs, ServerConfig,
    ServerError, ServerListeners, TlsFiles, TunnelRequestInterceptor, TunnelServer,
    TunnelStateListener,
};

// Client
pub use backhaul_client::{
    ClientConfig, ClientOptions, ConfigError, ConnectionListener, ConnectionSnapshot,
    ConnectionState, ConnectionStatus, ErrorKind, RetryPolicy, TunnelClient, TunnelConnection,
    TunnelDefinition, TunnelError,
};
