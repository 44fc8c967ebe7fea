//! Tunnel server: control listener, vhost listeners and registries

use crate::config::ServerConfig;
use crate::error::{AdmissionError, ServerError};
use crate::handler::serve_control;
use crate::http::serve_vhosts;
use crate::interceptor::{
    BasicAuthInterceptor, DefaultTunnelRequestInterceptor, HeaderRulesInterceptor,
    HttpRequestInterceptor, TunnelRequestInterceptor,
};
use crate::listener::ServerListeners;
use backhaul_connection::server_acceptor;
use backhaul_proto::TunnelRequest;
use backhaul_router::{RegistryError, TcpRegistry, TunnelSnapshot, VhostKey, VhostRegistry};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// State shared by every listener task of one server
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) tcp: Arc<TcpRegistry>,
    pub(crate) vhosts: Arc<VhostRegistry>,
    pub(crate) interceptors: Vec<Arc<dyn TunnelRequestInterceptor>>,
    pub(crate) http_interceptors: Vec<Arc<dyn HttpRequestInterceptor>>,
    pub(crate) listeners: ServerListeners,
    pub(crate) shutdown: CancellationToken,
    next_tunnel_id: AtomicI64,
}

impl ServerContext {
    pub(crate) fn next_tunnel_id(&self) -> i64 {
        self.next_tunnel_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Every interceptor in order; the first refusal wins
    pub(crate) fn intercept(&self, request: TunnelRequest) -> Result<TunnelRequest, AdmissionError> {
        self.interceptors
            .iter()
            .try_fold(request, |request, interceptor| interceptor.intercept(request))
    }
}

/// Addresses the server actually bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAddrs {
    pub control: SocketAddr,
    pub http: Option<SocketAddr>,
    pub https: Option<SocketAddr>,
}

/// Public side of the relay
///
/// `new` only allocates; sockets are bound by [`TunnelServer::start`].
pub struct TunnelServer {
    config: ServerConfig,
    tcp: Arc<TcpRegistry>,
    vhosts: Arc<VhostRegistry>,
    interceptors: Vec<Arc<dyn TunnelRequestInterceptor>>,
    http_interceptors: Vec<Arc<dyn HttpRequestInterceptor>>,
    listeners: ServerListeners,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        let tcp = Arc::new(TcpRegistry::new(config.tcp_bind_host));
        let default_policy = DefaultTunnelRequestInterceptor::new(&config, tcp.clone());

        Self {
            config,
            tcp,
            vhosts: Arc::new(VhostRegistry::new()),
            interceptors: vec![Arc::new(default_policy) as Arc<dyn TunnelRequestInterceptor>],
            http_interceptors: vec![
                Arc::new(BasicAuthInterceptor) as Arc<dyn HttpRequestInterceptor>,
                Arc::new(HeaderRulesInterceptor),
            ],
            listeners: ServerListeners::default(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Add an admission hook; runs after the built-in policy
    pub fn with_interceptor(mut self, interceptor: impl TunnelRequestInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Add an HTTP hook; runs after Basic-Auth and header rules
    pub fn with_http_interceptor(
        mut self,
        interceptor: impl HttpRequestInterceptor + 'static,
    ) -> Self {
        self.http_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_listeners(mut self, listeners: ServerListeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind every configured listener and start accepting
    pub async fn start(&self) -> Result<ServerAddrs, ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }

        let tls = self.tls_acceptor()?;
        let control_tls = if self.config.control_tls {
            Some(tls.clone().ok_or_else(|| {
                ServerError::Config("control_tls requires tls.cert_path and tls.key_path".to_string())
            })?)
        } else {
            None
        };
        let https_tls = match (self.config.https_addr, &tls) {
            (Some(_), None) => {
                return Err(ServerError::Config(
                    "https_addr requires tls.cert_path and tls.key_path".to_string(),
                ))
            }
            (_, tls) => tls.clone(),
        };

        let control = bind(self.config.control_addr).await?;
        let http = match self.config.http_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };
        let https = match self.config.https_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };

        let addrs = ServerAddrs {
            control: control.local_addr()?,
            http: http.as_ref().map(|l| l.local_addr()).transpose()?,
            https: https.as_ref().map(|l| l.local_addr()).transpose()?,
        };

        let ctx = Arc::new(ServerContext {
            config: self.config.clone(),
            tcp: self.tcp.clone(),
            vhosts: self.vhosts.clone(),
            interceptors: self.interceptors.clone(),
            http_interceptors: self.http_interceptors.clone(),
            listeners: self.listeners.clone(),
            shutdown: self.shutdown.clone(),
            next_tunnel_id: AtomicI64::new(1),
        });

        tokio::spawn(serve_control(control, control_tls, ctx.clone()));
        if let Some(listener) = http {
            tokio::spawn(serve_vhosts(listener, None, ctx.clone()));
        }
        if let (Some(listener), Some(acceptor)) = (https, https_tls) {
            tokio::spawn(serve_vhosts(listener, Some(acceptor), ctx));
        }

        info!("Tunnel server started: {:?}", addrs);
        Ok(addrs)
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ServerError> {
        match &self.config.tls {
            Some(files) => Ok(Some(server_acceptor(&files.cert_path, &files.key_path)?)),
            None => Ok(None),
        }
    }

    /// Stop accepting and tear down every tunnel
    pub async fn shutdown(&self) {
        info!("Shutting down tunnel server");
        self.shutdown.cancel();
        self.tcp.clear().await;
        self.vhosts.clear().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Kick the client owning TCP `port` and drop its control connection;
    /// the port is free again once that connection is released
    pub fn force_off_tcp(&self, port: u16) -> Result<(), RegistryError> {
        self.tcp.force_off(&port)
    }

    pub fn force_off_vhost(&self, host: &str, https: bool) -> Result<(), RegistryError> {
        self.vhosts.force_off(&VhostKey::new(host, https))
    }

    pub fn tcp_registry(&self) -> &Arc<TcpRegistry> {
        &self.tcp
    }

    pub fn vhost_registry(&self) -> &Arc<VhostRegistry> {
        &self.vhosts
    }

    /// Every registered tunnel, TCP first
    pub async fn snapshots(&self) -> Vec<TunnelSnapshot> {
        let mut snapshots = self.tcp.snapshots().await;
        snapshots.extend(self.vhosts.snapshots().await);
        snapshots
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        address: addr.to_string(),
        reason: e.to_string(),
    })
}
