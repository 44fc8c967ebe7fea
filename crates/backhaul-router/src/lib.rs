//! Tunnel registries
//!
//! One registry is keyed by TCP port, the other by HTTP/HTTPS virtual host.
//! Registration is atomic per key: at most one [`TunnelDescriptor`] can own a
//! port or a `(host, scheme)` pair at any time.

pub mod descriptor;
pub mod port;
pub mod registry;

pub use descriptor::{TunnelDescriptor, TunnelSnapshot};
pub use port::{is_port_available, PortRange, PortRangeError};
pub use registry::{RegistryError, TcpRegistry, TunnelRegistry, VhostKey, VhostRegistry};
