//! Key -> tunnel registries with atomic check-then-insert

use crate::descriptor::{TunnelDescriptor, TunnelSnapshot};
use crate::port::is_port_available;
use backhaul_proto::normalize_host;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} already registered")]
    AlreadyRegistered(String),

    #[error("{0} not registered")]
    NotFound(String),

    #[error("Port {0} is in use by another process")]
    PortUnavailable(u16),
}

/// HTTP and HTTPS tunnels for the same host are separate entries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VhostKey {
    pub host: String,
    pub https: bool,
}

impl VhostKey {
    /// Key for `host`, normalised the same way incoming `Host` headers are
    pub fn new(host: &str, https: bool) -> Self {
        Self {
            host: normalize_host(host),
            https,
        }
    }
}

impl fmt::Display for VhostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.https { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.host)
    }
}

/// Concurrent map from key to the tunnel owning it
pub struct TunnelRegistry<K> {
    entries: DashMap<K, Arc<TunnelDescriptor>>,
}

pub type VhostRegistry = TunnelRegistry<VhostKey>;

impl<K> TunnelRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Bind `key` to `descriptor`, failing if the key is taken
    pub fn register(
        &self,
        key: K,
        descriptor: Arc<TunnelDescriptor>,
    ) -> Result<Arc<TunnelDescriptor>, RegistryError> {
        self.register_checked(key, descriptor, |_| Ok(()))
    }

    /// Like [`register`](Self::register), running `check` under the key's lock
    /// before inserting
    fn register_checked(
        &self,
        key: K,
        descriptor: Arc<TunnelDescriptor>,
        check: impl FnOnce(&K) -> Result<(), RegistryError>,
    ) -> Result<Arc<TunnelDescriptor>, RegistryError> {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyRegistered(entry.key().to_string())),
            Entry::Vacant(entry) => {
                check(entry.key())?;
                info!(
                    "Registered {} for tunnel {}",
                    entry.key(),
                    descriptor.tunnel_id()
                );
                entry.insert(descriptor.clone());
                Ok(descriptor)
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<TunnelDescriptor>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the binding and tear down its sessions
    pub async fn unregister(&self, key: &K) -> Result<Arc<TunnelDescriptor>, RegistryError> {
        let (_, descriptor) = self
            .entries
            .remove(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;

        debug!("Unregistered {} (tunnel {})", key, descriptor.tunnel_id());
        descriptor.teardown().await;
        Ok(descriptor)
    }

    /// Unregister only if `key` is still owned by `tunnel_id`
    ///
    /// Used by connection cleanup so a tunnel that lost its slot cannot evict
    /// the one that took it over.
    pub async fn unregister_owned(&self, key: &K, tunnel_id: i64) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, descriptor| descriptor.tunnel_id() == tunnel_id);

        match removed {
            Some((_, descriptor)) => {
                debug!("Unregistered {} (tunnel {})", key, tunnel_id);
                descriptor.teardown().await;
                true
            }
            None => false,
        }
    }

    /// Force off the tunnel owning `key` and close its control connection;
    /// the entry stays until that connection's owner releases it
    pub fn force_off(&self, key: &K) -> Result<(), RegistryError> {
        let descriptor = self
            .get(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        descriptor.force_off();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> Vec<Arc<TunnelDescriptor>> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub async fn snapshots(&self) -> Vec<TunnelSnapshot> {
        let mut snapshots = Vec::new();
        for descriptor in self.descriptors() {
            snapshots.push(descriptor.snapshot().await);
        }
        snapshots
    }

    /// Tear down every tunnel
    pub async fn clear(&self) {
        let keys: Vec<K> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let _ = self.unregister(&key).await;
        }
    }
}

impl<K> Default for TunnelRegistry<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry<VhostKey> {
    pub fn lookup(&self, host: &str, https: bool) -> Option<Arc<TunnelDescriptor>> {
        self.get(&VhostKey::new(host, https))
    }
}

/// Port-keyed registry that also checks the OS before taking a port
pub struct TcpRegistry {
    inner: TunnelRegistry<u16>,
    bind_host: IpAddr,
}

impl TcpRegistry {
    /// `bind_host` is the address public TCP listeners bind to
    pub fn new(bind_host: IpAddr) -> Self {
        Self {
            inner: TunnelRegistry::new(),
            bind_host,
        }
    }

    pub fn bind_host(&self) -> IpAddr {
        self.bind_host
    }

    pub fn register(
        &self,
        port: u16,
        descriptor: Arc<TunnelDescriptor>,
    ) -> Result<Arc<TunnelDescriptor>, RegistryError> {
        let host = self.bind_host;
        self.inner.register_checked(port, descriptor, |port| {
            if is_port_available(host, *port) {
                Ok(())
            } else {
                Err(RegistryError::PortUnavailable(*port))
            }
        })
    }
}

impl std::ops::Deref for TcpRegistry {
    type Target = TunnelRegistry<u16>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
