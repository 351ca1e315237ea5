//! Drain, kill and pause operations
//!
//! Tunnels pointing at a job are closed before the job is deleted so that no
//! local port outlives the replica it forwards to.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use ucompute_common::cluster::ClusterApi;
use ucompute_tunnel::{CloseReport, SharedTunnelRegistry};

use crate::error::MaintenanceError;
use crate::pause::PauseState;

/// Outcome of draining one node
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Drained node
    pub node: String,
    /// Jobs that had replicas on the node and were deleted
    pub jobs_deleted: Vec<String>,
    /// Jobs whose deletion failed after retries
    pub jobs_failed: Vec<(String, ucompute_common::Error)>,
    /// Tunnels closed because their job was deleted
    pub tunnels: CloseReport,
}

impl DrainReport {
    /// Whether every job was deleted and every tunnel closed cleanly
    pub fn is_complete(&self) -> bool {
        self.jobs_failed.is_empty() && self.tunnels.is_clean()
    }
}

/// Outcome of draining every node
#[derive(Debug, Default)]
pub struct ClusterDrainReport {
    /// Nodes that were drained
    pub nodes: Vec<DrainReport>,
    /// Nodes that could not be cordoned or listed
    pub failed_nodes: Vec<(String, MaintenanceError)>,
}

impl ClusterDrainReport {
    /// Whether every node drained completely
    pub fn is_complete(&self) -> bool {
        self.failed_nodes.is_empty() && self.nodes.iter().all(DrainReport::is_complete)
    }
}

/// Outcome of killing a job
#[derive(Debug, Default)]
pub struct KillReport {
    /// Whether the job still existed in the cluster
    pub deleted: bool,
    /// Tunnels of the job that were closed
    pub tunnels: CloseReport,
}

/// Maintenance operations over the cluster and the open tunnels
pub struct Maintenance {
    cluster: Arc<dyn ClusterApi>,
    tunnels: SharedTunnelRegistry,
    pause: PauseState,
}

impl Maintenance {
    /// Create the maintenance surface
    pub fn new(cluster: Arc<dyn ClusterApi>, tunnels: SharedTunnelRegistry, pause: PauseState) -> Self {
        Self {
            cluster,
            tunnels,
            pause,
        }
    }

    /// Restore the persisted pause flag into the shared state
    pub async fn load_pause_state(&self) -> Result<bool, MaintenanceError> {
        let paused = self.cluster.load_pause_state().await?;
        self.pause.set(paused);
        info!(paused, "Loaded maintenance pause state");
        Ok(paused)
    }

    /// Whether scheduling is paused
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Persist and apply the pause flag
    ///
    /// The local flag only changes once the cluster has stored the new value.
    pub async fn set_pause_state(&self, paused: bool) -> Result<(), MaintenanceError> {
        self.cluster.store_pause_state(paused).await?;
        let previous = self.pause.set(paused);
        if previous != paused {
            info!(paused, "Maintenance pause state changed");
        }
        Ok(())
    }

    /// Alias of [`set_pause_state`](Self::set_pause_state)
    pub async fn update_pause_state(&self, paused: bool) -> Result<(), MaintenanceError> {
        self.set_pause_state(paused).await
    }

    /// Fail with `ClusterPaused` if new work must not be scheduled
    pub fn ensure_schedulable(&self) -> Result<(), MaintenanceError> {
        if self.pause.is_paused() {
            return Err(MaintenanceError::ClusterPaused);
        }
        Ok(())
    }

    /// Evacuate one node
    ///
    /// Cordons the node and deletes every job with a replica placed on it.
    /// Deleting a job stops all of its ranks, so every tunnel of those jobs is
    /// closed, including tunnels to ranks on other nodes. Tunnels of unrelated
    /// jobs are left open. Teardown and per-job failures are collected in the
    /// report; cordon and listing failures abort the drain.
    pub async fn drain_node(&self, node: &str) -> Result<DrainReport, MaintenanceError> {
        info!(node, "Draining node");
        self.cluster.cordon_node(node).await?;

        let placements = self.cluster.list_placements_on_node(node).await?;
        let replicas = placements.len();
        let jobs: BTreeSet<String> = placements.into_iter().map(|p| p.job_id).collect();
        debug!(node, replicas, jobs = jobs.len(), "Found replicas on node");

        let tunnels = self.tunnels.close_where(|key| jobs.contains(&key.job_id)).await;

        let mut report = DrainReport {
            node: node.to_string(),
            tunnels,
            ..Default::default()
        };
        for job_id in jobs {
            match self.cluster.delete_job(&job_id).await {
                Ok(()) => report.jobs_deleted.push(job_id),
                Err(e) if e.is_not_found() => {
                    debug!(node, job_id = %job_id, "Job already gone");
                    report.jobs_deleted.push(job_id);
                }
                Err(e) => {
                    warn!(node, job_id = %job_id, error = %e, "Failed to delete job during drain");
                    report.jobs_failed.push((job_id, e));
                }
            }
        }

        info!(
            node,
            jobs_deleted = report.jobs_deleted.len(),
            jobs_failed = report.jobs_failed.len(),
            tunnels_closed = report.tunnels.closed.len(),
            tunnels_failed = report.tunnels.failed.len(),
            "Node drained"
        );
        Ok(report)
    }

    /// Pause scheduling and drain every node
    pub async fn drain_cluster(&self) -> Result<ClusterDrainReport, MaintenanceError> {
        self.set_pause_state(true).await?;
        let nodes = self.cluster.list_nodes().await?;
        info!(nodes = nodes.len(), "Draining cluster");

        let mut report = ClusterDrainReport::default();
        for node in nodes {
            match self.drain_node(&node).await {
                Ok(drained) => report.nodes.push(drained),
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to drain node");
                    report.failed_nodes.push((node, e));
                }
            }
        }
        Ok(report)
    }

    /// Terminate a job and close all of its tunnels
    ///
    /// Allowed while paused. A job that no longer exists is not an error.
    pub async fn kill_job(&self, job_id: &str) -> Result<KillReport, MaintenanceError> {
        let tunnels = self.tunnels.close_job(job_id).await;

        let deleted = match self.cluster.delete_job(job_id).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };

        info!(job_id, deleted, tunnels_closed = tunnels.total(), "Job killed");
        Ok(KillReport { deleted, tunnels })
    }
}
