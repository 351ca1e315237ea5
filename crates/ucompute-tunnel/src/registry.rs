//! Registry of open tunnels
//!
//! Tunnels are keyed by (job id, rank). Bulk operations detach every target
//! from the map first and close them afterwards, so no shard lock is held
//! across a teardown and a failing teardown never blocks the others.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::tunnel::{Tunnel, TunnelKey};

/// Shared reference to a tunnel registry
pub type SharedTunnelRegistry = Arc<TunnelRegistry>;

/// Outcome of a bulk close
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Tunnels torn down cleanly
    pub closed: Vec<TunnelKey>,
    /// Tunnels whose teardown failed. They are detached either way.
    pub failed: Vec<(TunnelKey, TunnelError)>,
}

impl CloseReport {
    /// Whether every teardown succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of tunnels handled
    pub fn total(&self) -> usize {
        self.closed.len() + self.failed.len()
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: CloseReport) {
        self.closed.extend(other.closed);
        self.failed.extend(other.failed);
    }
}

/// Registry of open tunnels
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<TunnelKey, Arc<Tunnel>>,
}

impl TunnelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened tunnel
    ///
    /// Fails with `AlreadyOpen` if a live tunnel exists for the same replica.
    /// A leftover that was already closed is replaced.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Result<Arc<Tunnel>, TunnelError> {
        let key = tunnel.key().clone();
        match self.tunnels.entry(key) {
            Entry::Occupied(mut existing) if existing.get().is_closed() => {
                debug!(tunnel = %existing.key(), "Replacing closed tunnel");
                existing.insert(Arc::clone(&tunnel));
            }
            Entry::Occupied(existing) => {
                return Err(TunnelError::AlreadyOpen {
                    job_id: existing.key().job_id.clone(),
                    rank: existing.key().rank,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&tunnel));
            }
        }

        info!(
            tunnel = %tunnel.key(),
            local_port = tunnel.local_port(),
            ip = %tunnel.ip_address(),
            "Tunnel registered"
        );
        Ok(tunnel)
    }

    /// Look up the tunnel for a replica
    pub fn get(&self, job_id: &str, rank: u32) -> Option<Arc<Tunnel>> {
        self.tunnels
            .get(&TunnelKey::new(job_id, rank))
            .map(|t| Arc::clone(t.value()))
    }

    /// Number of tracked tunnels
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Whether no tunnels are tracked
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Keys of all tracked tunnels, sorted
    pub fn keys(&self) -> Vec<TunnelKey> {
        let mut keys: Vec<TunnelKey> = self.tunnels.iter().map(|t| t.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Stop tracking a tunnel without closing it
    pub fn remove(&self, job_id: &str, rank: u32) -> Option<Arc<Tunnel>> {
        self.tunnels
            .remove(&TunnelKey::new(job_id, rank))
            .map(|(_, t)| t)
    }

    /// Detach and close the tunnel for one replica
    ///
    /// Returns `Ok(false)` when no tunnel was tracked for it.
    pub async fn close(&self, job_id: &str, rank: u32) -> Result<bool, TunnelError> {
        match self.remove(job_id, rank) {
            Some(tunnel) => tunnel.close().await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Detach and close every rank of a job
    pub async fn close_job(&self, job_id: &str) -> CloseReport {
        self.close_where(|key| key.job_id == job_id).await
    }

    /// Detach and close every tunnel whose key matches `pred`
    pub async fn close_where<F>(&self, pred: F) -> CloseReport
    where
        F: Fn(&TunnelKey) -> bool,
    {
        let mut detached = Vec::new();
        self.tunnels.retain(|key, tunnel| {
            if pred(key) {
                detached.push(Arc::clone(tunnel));
                false
            } else {
                true
            }
        });
        close_detached(detached).await
    }

    /// Detach and close everything
    pub async fn close_all(&self) -> CloseReport {
        self.close_where(|_| true).await
    }

    /// Probe every tunnel and close the ones that stopped forwarding
    ///
    /// Returns the keys of the reaped tunnels.
    pub async fn reap_dead(&self) -> Vec<TunnelKey> {
        let snapshot: Vec<Arc<Tunnel>> = self.tunnels.iter().map(|t| Arc::clone(t.value())).collect();
        let probes = join_all(snapshot.iter().map(|t| t.is_alive())).await;

        let mut dead = Vec::new();
        for (tunnel, alive) in snapshot.into_iter().zip(probes) {
            if alive {
                continue;
            }
            // Skip tunnels that were replaced or detached while probing
            let removed = self
                .tunnels
                .remove_if(tunnel.key(), |_, current| Arc::ptr_eq(current, &tunnel));
            if removed.is_some() {
                dead.push(tunnel);
            }
        }

        let report = close_detached(dead).await;
        if report.total() > 0 {
            info!(reaped = report.total(), failed = report.failed.len(), "Reaped dead tunnels");
        }
        report
            .closed
            .into_iter()
            .chain(report.failed.into_iter().map(|(key, _)| key))
            .collect()
    }
}

async fn close_detached(tunnels: Vec<Arc<Tunnel>>) -> CloseReport {
    let results = join_all(tunnels.iter().map(|t| async move {
        (t.key().clone(), t.close().await)
    }))
    .await;

    let mut report = CloseReport::default();
    for (key, result) in results {
        match result {
            Ok(()) => report.closed.push(key),
            Err(e) => {
                warn!(tunnel = %key, error = %e, "Failed to close tunnel");
                report.failed.push((key, e));
            }
        }
    }
    report
}
