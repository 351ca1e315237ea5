//! Tunnel error types

use thiserror::Error;
use ucompute_common::job::JobState;

/// Errors raised while opening, probing or closing tunnels
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The liveness probe could not be carried out
    #[error("liveness probe failed: {0}")]
    Probe(String),

    /// Teardown of the forwarding transport failed
    #[error("failed to tear down tunnel for job {job_id} rank {rank}: {message}")]
    Teardown {
        /// Job the tunnel belongs to
        job_id: String,
        /// Replica rank
        rank: u32,
        /// Transport error
        message: String,
    },

    /// A live tunnel already exists for the replica
    #[error("tunnel already open for job {job_id} rank {rank}")]
    AlreadyOpen {
        /// Job identifier
        job_id: String,
        /// Replica rank
        rank: u32,
    },

    /// The replica exists but is not running
    #[error("job {job_id} rank {rank} is not running (state: {state})")]
    JobNotRunning {
        /// Job identifier
        job_id: String,
        /// Replica rank
        rank: u32,
        /// Current state of the replica
        state: JobState,
    },

    /// No replica with this rank exists for the job
    #[error("no replica with rank {rank} for job {job_id}")]
    ReplicaNotFound {
        /// Job identifier
        job_id: String,
        /// Replica rank
        rank: u32,
    },

    /// The replica has no address assigned yet
    #[error("job {job_id} rank {rank} has no address yet")]
    NoAddress {
        /// Job identifier
        job_id: String,
        /// Replica rank
        rank: u32,
    },

    /// No local port could be reserved
    #[error("failed to reserve local port: {0}")]
    PortAllocation(String),

    /// The forwarding transport could not be set up
    #[error("failed to connect to job {job_id}: {message}")]
    Connect {
        /// Job identifier
        job_id: String,
        /// Transport error
        message: String,
    },

    /// Transport-level failure inside a backend
    #[error("tunnel backend error: {0}")]
    Backend(String),

    /// Cluster API failure
    #[error(transparent)]
    Cluster(#[from] ucompute_common::Error),
}

impl TunnelError {
    /// Whether the failure was caused by the replica's state rather than the transport
    pub fn is_replica_unavailable(&self) -> bool {
        matches!(
            self,
            Self::JobNotRunning { .. } | Self::ReplicaNotFound { .. } | Self::NoAddress { .. }
        )
    }
}
