//! Backhaul CLI - run a tunnel server or expose local services through one

use anyhow::{bail, Context, Result};
use backhaul_lib::{
    ClientConfig, ConnectionListener, ErrorKind, ServerConfig, ServerListeners, TunnelClient,
    TunnelServer, TunnelStateListener, TunnelType,
};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Backhaul - expose local TCP and HTTP services through a public relay
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Reverse tunnel relay: server and client", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    Server {
        /// YAML config file
        #[arg(short, long, env = "BACKHAUL_SERVER_CONFIG")]
        config: Option<PathBuf>,

        /// Control listener address (overrides config)
        #[arg(long, env = "BACKHAUL_CONTROL_ADDR")]
        control_addr: Option<SocketAddr>,

        /// HTTP virtual-host listener address (overrides config)
        #[arg(long)]
        http_addr: Option<SocketAddr>,

        /// HTTPS virtual-host listener address (overrides config)
        #[arg(long)]
        https_addr: Option<SocketAddr>,

        /// Token clients must present (overrides config)
        #[arg(long, env = "BACKHAUL_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
    /// Open the tunnels of a config file
    Client {
        /// YAML config file
        #[arg(short, long, env = "BACKHAUL_CLIENT_CONFIG")]
        config: PathBuf,

        /// Server control address, host:port (overrides config)
        #[arg(short, long, env = "BACKHAUL_SERVER")]
        server: Option<String>,

        /// Auth token (overrides config)
        #[arg(short, long, env = "BACKHAUL_AUTH_TOKEN")]
        token: Option<String>,

        /// Encrypt tunnel payloads
        #[arg(long)]
        encrypt: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server {
            config,
            control_addr,
            http_addr,
            https_addr,
            auth_token,
        } => {
            let mut config: ServerConfig = match config {
                Some(path) => load_yaml(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(addr) = control_addr {
                config.control_addr = addr;
            }
            if http_addr.is_some() {
                config.http_addr = http_addr;
            }
            if https_addr.is_some() {
                config.https_addr = https_addr;
            }
            if auth_token.is_some() {
                config.auth_token = auth_token;
            }
            run_server(config).await
        }
        Commands::Client {
            config,
            server,
            token,
            encrypt,
        } => {
            let mut config: ClientConfig = load_yaml(&config)?;
            if let Some(server) = server {
                config.server_addr = server;
            }
            if token.is_some() {
                config.auth_token = token;
            }
            config.encrypt |= encrypt;
            run_client(config).await
        }
    }
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let tunnel_log = TunnelStateListener::default()
        .on_bind(|request| info!("Tunnel bound: {}", request))
        .on_unbind(|request| info!("Tunnel released: {}", request));
    let listeners = ServerListeners {
        tcp: tunnel_log.clone(),
        http: tunnel_log,
        ..ServerListeners::default()
    };

    let server = TunnelServer::new(config).with_listeners(listeners);
    let addrs = server.start().await.context("Failed to start server")?;

    info!("Control listener: {}", addrs.control);
    if let Some(http) = addrs.http {
        info!("HTTP listener: {}", http);
    }
    if let Some(https) = addrs.https {
        info!("HTTPS listener: {}", https);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down server...");
    server.shutdown().await;
    Ok(())
}

async fn run_client(config: ClientConfig) -> Result<()> {
    let requests = config.requests()?;
    if requests.is_empty() {
        bail!("No tunnels configured");
    }
    let options = config.to_options()?;

    let listener = ConnectionListener::default()
        .on_connected(|request| match request.tunnel_type {
            TunnelType::Tcp => info!(
                "Tunnel ready: tcp port {} -> {}",
                request.remote_port,
                request.local_target()
            ),
            _ => info!(
                "Tunnel ready: {} -> {}",
                request.virtual_host.as_deref().unwrap_or_default(),
                request.local_target()
            ),
        })
        .on_disconnected(|request, err| match err.map(|e| (e.kind(), e)) {
            Some((ErrorKind::Admission, e)) => error!(
                "Tunnel {} refused: {}",
                request.local_target(),
                e.rejection_reason().unwrap_or_default()
            ),
            Some((_, e)) => warn!("Tunnel {} disconnected: {}", request.local_target(), e),
            None => info!("Tunnel {} closed", request.local_target()),
        });

    let client = TunnelClient::new(options).with_listener(listener);
    for request in requests {
        client.connect(config.server_addr.clone(), request, config.encrypt);
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down tunnels...");
        }
        _ = all_closed(&client) => {
            warn!("Every tunnel has closed");
        }
    }
    client.close_all();
    Ok(())
}

async fn all_closed(client: &TunnelClient) {
    for connection in client.connections() {
        connection.closed().await;
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
