//! Local port reservation

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::TunnelError;

/// A bound local listener handed to a tunnel backend
///
/// The port stays reserved for as long as the listener is alive.
#[derive(Debug)]
pub struct ReservedPort {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ReservedPort {
    /// Port number the listener is bound to
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Full address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Take ownership of the listener
    pub fn into_listener(self) -> TcpListener {
        self.listener
    }
}

/// Reserves ephemeral ports on the local host
#[derive(Clone, Debug)]
pub struct PortAllocator {
    bind_address: IpAddr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    /// Allocator binding on the given interface
    pub fn new(bind_address: IpAddr) -> Self {
        Self { bind_address }
    }

    /// Interface ports are bound on
    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    /// Bind a fresh ephemeral port
    pub async fn reserve(&self) -> Result<ReservedPort, TunnelError> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind_address, 0))
            .await
            .map_err(|e| TunnelError::PortAllocation(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TunnelError::PortAllocation(e.to_string()))?;
        debug!(port = addr.port(), "Reserved local port");
        Ok(ReservedPort { listener, addr })
    }
}
