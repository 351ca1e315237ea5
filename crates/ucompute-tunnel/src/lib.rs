//! Port-forward tunnels from the service host into running job replicas
//!
//! A [`Tunnel`] binds a local TCP port and relays connections to one replica
//! (a job id plus rank). Tunnels are tracked in a [`TunnelRegistry`] so the
//! maintenance layer can tear them down when a job stops or a node drains.
//! [`TunnelService`] ties placement lookup, port reservation and the transport
//! together.

#![deny(missing_docs)]

pub mod error;
pub mod port;
pub mod port_forward;
pub mod registry;
pub mod service;
pub mod tunnel;

pub use error::TunnelError;
pub use port::{PortAllocator, ReservedPort};
pub use port_forward::{DirectConnector, KubePortForwardConnector, PortForwardBackend};
pub use registry::{CloseReport, SharedTunnelRegistry, TunnelRegistry};
pub use service::{TunnelConnector, TunnelService, TunnelTarget};
pub use tunnel::{Tunnel, TunnelBackend, TunnelKey};
