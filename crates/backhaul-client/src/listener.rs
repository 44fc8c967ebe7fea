//! Connection lifecycle observers

use crate::error::TunnelError;
use backhaul_proto::TunnelRequest;
use std::sync::Arc;

pub type RequestCallback = Arc<dyn Fn(&TunnelRequest) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&TunnelRequest, Option<&TunnelError>) + Send + Sync>;

/// Optional callbacks for each connection attempt
///
/// `connected` receives the request as accepted by the server (e.g. with the
/// allocated port). `disconnected` fires when an attempt ends, with the error
/// if it ended abnormally.
#[derive(Clone, Default)]
pub struct ConnectionListener {
    pub connecting: Option<RequestCallback>,
    pub connected: Option<RequestCallback>,
    pub disconnected: Option<DisconnectCallback>,
}

impl ConnectionListener {
    pub fn on_connecting(mut self, f: impl Fn(&TunnelRequest) + Send + Sync + 'static) -> Self {
        self.connecting = Some(Arc::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl Fn(&TunnelRequest) + Send + Sync + 'static) -> Self {
        self.connected = Some(Arc::new(f));
        self
    }

    pub fn on_disconnected(
        mut self,
        f: impl Fn(&TunnelRequest, Option<&TunnelError>) + Send + Sync + 'static,
    ) -> Self {
        self.disconnected = Some(Arc::new(f));
        self
    }

    pub(crate) fn notify_connecting(&self, request: &TunnelRequest) {
        if let Some(callback) = &self.connecting {
            callback(request);
        }
    }

    pub(crate) fn notify_connected(&self, request: &TunnelRequest) {
        if let Some(callback) = &self.connected {
            callback(request);
        }
    }

    pub(crate) fn notify_disconnected(&self, request: &TunnelRequest, error: Option<&TunnelError>) {
        if let Some(callback) = &self.disconnected {
            callback(request, error);
        }
    }
}
