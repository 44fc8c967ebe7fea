//! Tunnel client: owns every tunnel connection of the process

use crate::connection::{ConnectionSnapshot, TunnelConnection};
use crate::listener::ConnectionListener;
use crate::options::ClientOptions;
use backhaul_connection::TrafficListener;
use backhaul_proto::TunnelRequest;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct TunnelClient {
    options: Arc<ClientOptions>,
    listener: ConnectionListener,
    traffic: TrafficListener,
    connections: DashMap<u64, TunnelConnection>,
    next_id: AtomicU64,
}

impl TunnelClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options: Arc::new(options),
            listener: ConnectionListener::default(),
            traffic: TrafficListener::default(),
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_listener(mut self, listener: ConnectionListener) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_traffic_listener(mut self, traffic: TrafficListener) -> Self {
        self.traffic = traffic;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Start a tunnel connection and return its handle right away
    ///
    /// The handshake runs in the background; use
    /// [`TunnelConnection::wait_established`] or the listener to observe it.
    /// Must be called within a Tokio runtime.
    pub fn connect(
        &self,
        server_addr: impl Into<String>,
        request: TunnelRequest,
        use_encryption: bool,
    ) -> TunnelConnection {
        let server_addr = server_addr.into();
        info!("Opening tunnel {} via {}", request, server_addr);

        let connection = TunnelConnection::spawn(
            server_addr,
            request,
            use_encryption,
            self.options.clone(),
            self.listener.clone(),
            self.traffic.clone(),
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, connection.clone());
        connection
    }

    /// Live connections; closed ones are forgotten
    pub fn connections(&self) -> Vec<TunnelConnection> {
        self.connections.retain(|_, connection| !connection.is_closed());
        let mut live: Vec<(u64, TunnelConnection)> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        live.sort_by_key(|(id, _)| *id);
        live.into_iter().map(|(_, connection)| connection).collect()
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.connections()
            .iter()
            .map(TunnelConnection::snapshot)
            .collect()
    }

    /// Close every connection; none of them will retry
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::options::RetryPolicy;

    #[tokio::test]
    async fn test_close_all_stops_retrying_connections() {
        let unused = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let client = TunnelClient::new(ClientOptions {
            retry: RetryPolicy::ALWAYS,
            ..ClientOptions::default()
        });

        let first = client.connect(unused.clone(), TunnelRequest::tcp("127.0.0.1", 22, 0), false);
        let second = client.connect(unused, TunnelRequest::tcp("127.0.0.1", 23, 0), false);
        assert_eq!(client.connections().len(), 2);
        assert_eq!(client.snapshots()[1].request.local_port, 23);

        client.close_all();
        first.closed().await;
        second.closed().await;
        assert_eq!(first.state(), ConnectionState::Closed);
        assert!(client.connections().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connection_without_retry_is_pruned() {
        let unused = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let client = TunnelClient::new(ClientOptions {
            retry: RetryPolicy::NEVER,
            ..ClientOptions::default()
        });

        let connection = client.connect(unused, TunnelRequest::tcp("127.0.0.1", 22, 0), false);
        assert!(connection.wait_established().await.is_err());
        assert!(client.connections().is_empty());
    }
}
