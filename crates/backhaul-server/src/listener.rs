//! Tunnel state observers

use backhaul_connection::TrafficListener;
use backhaul_proto::{TunnelRequest, TunnelType};
use std::sync::Arc;

pub type TunnelCallback = Arc<dyn Fn(&TunnelRequest) + Send + Sync>;

/// Called when a tunnel is registered (`bind`) or released (`unbind`)
#[derive(Clone, Default)]
pub struct TunnelStateListener {
    pub bind: Option<TunnelCallback>,
    pub unbind: Option<TunnelCallback>,
}

impl TunnelStateListener {
    pub fn on_bind(mut self, f: impl Fn(&TunnelRequest) + Send + Sync + 'static) -> Self {
        self.bind = Some(Arc::new(f));
        self
    }

    pub fn on_unbind(mut self, f: impl Fn(&TunnelRequest) + Send + Sync + 'static) -> Self {
        self.unbind = Some(Arc::new(f));
        self
    }

    pub(crate) fn notify_bind(&self, request: &TunnelRequest) {
        if let Some(callback) = &self.bind {
            callback(request);
        }
    }

    pub(crate) fn notify_unbind(&self, request: &TunnelRequest) {
        if let Some(callback) = &self.unbind {
            callback(request);
        }
    }
}

/// Every observer a [`crate::TunnelServer`] reports to
#[derive(Clone, Default)]
pub struct ServerListeners {
    pub tcp: TunnelStateListener,
    /// HTTP and HTTPS tunnels
    pub http: TunnelStateListener,
    pub traffic: TrafficListener,
}

impl ServerListeners {
    pub(crate) fn for_type(&self, tunnel_type: TunnelType) -> &TunnelStateListener {
        match tunnel_type {
            TunnelType::Tcp => &self.tcp,
            _ => &self.http,
        }
    }
}
