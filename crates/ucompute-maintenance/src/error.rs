//! Maintenance error types

use thiserror::Error;

/// Errors returned by maintenance operations
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// Scheduling is paused for maintenance
    #[error("cluster is paused for maintenance")]
    ClusterPaused,

    /// Cluster API failure
    #[error(transparent)]
    Cluster(#[from] ucompute_common::Error),
}

impl MaintenanceError {
    /// Stable code for RPC callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClusterPaused => "CLUSTER_PAUSED",
            Self::Cluster(ucompute_common::Error::NotFound { .. }) => "NOT_FOUND",
            Self::Cluster(_) => "CLUSTER_UNAVAILABLE",
        }
    }
}
