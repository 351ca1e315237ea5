//! A single tunnel into one job replica

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ucompute_common::net::Address;

use crate::error::TunnelError;

/// Identifies the replica a tunnel points at
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    /// Job identifier
    pub job_id: String,
    /// Replica rank within the job
    pub rank: u32,
}

impl TunnelKey {
    /// Create a key
    pub fn new(job_id: impl Into<String>, rank: u32) -> Self {
        Self {
            job_id: job_id.into(),
            rank,
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.job_id, self.rank)
    }
}

/// Transport that carries a tunnel's traffic
///
/// Implementations own the local listener and whatever forwarding process or
/// task relays the bytes. `close` must release both.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Probe whether the transport still forwards traffic
    async fn is_alive(&self) -> Result<bool, TunnelError>;

    /// Release the local port and stop forwarding
    async fn close(&self) -> Result<(), TunnelError>;
}

/// A local port forwarded to one replica of a running job
pub struct Tunnel {
    key: TunnelKey,
    ip_address: Address,
    local_port: u16,
    backend: Arc<dyn TunnelBackend>,
    closed: AtomicBool,
    /// Set once teardown has run, successful or not
    teardown_done: Mutex<bool>,
}

impl Tunnel {
    /// Create a tunnel around an already connected backend
    pub fn new(
        job_id: impl Into<String>,
        rank: u32,
        ip_address: Address,
        local_port: u16,
        backend: Arc<dyn TunnelBackend>,
    ) -> Self {
        Self {
            key: TunnelKey::new(job_id, rank),
            ip_address,
            local_port,
            backend,
            closed: AtomicBool::new(false),
            teardown_done: Mutex::new(false),
        }
    }

    /// Replica this tunnel points at
    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    /// Job identifier
    pub fn job_id(&self) -> &str {
        &self.key.job_id
    }

    /// Replica rank
    pub fn rank(&self) -> u32 {
        self.key.rank
    }

    /// Cluster-internal address of the replica
    pub fn ip_address(&self) -> Address {
        self.ip_address
    }

    /// Port on the local host that forwards to the replica
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the tunnel still forwards traffic
    ///
    /// Probe failures count as dead. Never true once `close` has started.
    pub async fn is_alive(&self) -> bool {
        if self.is_closed() {
            return false;
        }

        let alive = match self.backend.is_alive().await {
            Ok(alive) => alive,
            Err(e) => {
                debug!(tunnel = %self.key, error = %e, "Tunnel probe failed");
                false
            }
        };

        // A close may have started while the probe was in flight
        alive && !self.is_closed()
    }

    /// Tear the tunnel down
    ///
    /// Only the first call touches the backend; concurrent callers wait for it
    /// and later calls return `Ok(())`. A teardown failure is reported once.
    pub async fn close(&self) -> Result<(), TunnelError> {
        let mut done = self.teardown_done.lock().await;
        if *done {
            return Ok(());
        }

        self.closed.store(true, Ordering::SeqCst);
        let result = self.backend.close().await;
        *done = true;

        match result {
            Ok(()) => {
                info!(tunnel = %self.key, local_port = self.local_port, "Tunnel closed");
                Ok(())
            }
            Err(e) => {
                warn!(tunnel = %self.key, error = %e, "Tunnel teardown failed");
                Err(TunnelError::Teardown {
                    job_id: self.key.job_id.clone(),
                    rank: self.key.rank,
                    message: e.to_string(),
                })
            }
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("key", &self.key)
            .field("ip_address", &self.ip_address)
            .field("local_port", &self.local_port)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if *self.teardown_done.get_mut() {
            return;
        }

        warn!(tunnel = %self.key, local_port = self.local_port, "Tunnel dropped without close");
        self.closed.store(true, Ordering::SeqCst);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = Arc::clone(&self.backend);
                let key = self.key.clone();
                handle.spawn(async move {
                    if let Err(e) = backend.close().await {
                        warn!(tunnel = %key, error = %e, "Teardown of dropped tunnel failed");
                    }
                });
            }
            Err(_) => {
                warn!(tunnel = %self.key, "No runtime available to tear down dropped tunnel");
            }
        }
    }
}
