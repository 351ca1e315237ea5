//! Common types for ucompute: errors, networking utilities, the job model and
//! the cluster API collaborator.
//!
//! - [`net`] - IPv4 addresses, CIDR subnets, remapping and the address pool
//! - [`job`] - Job states and the events the cluster emits about them
//! - [`cluster`] - The `ClusterApi` trait and its kube-rs implementation
//! - [`retry`] - Exponential backoff for transient cluster failures
//! - [`telemetry`] - Tracing subscriber setup for binaries

#![deny(missing_docs)]

pub mod cluster;
pub mod error;
pub mod job;
pub mod net;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace where job pods run unless configured otherwise
pub const DEFAULT_JOB_NAMESPACE: &str = "app-kubernetes";

/// Label carrying the job identifier on every job pod
pub const JOB_ID_LABEL: &str = "ucloud.dk/job-id";

/// Label carrying the replica rank on every job pod
pub const RANK_LABEL: &str = "ucloud.dk/rank";

/// Name of the ConfigMap that persists the maintenance pause flag
pub const DEFAULT_PAUSE_CONFIGMAP: &str = "ucompute-maintenance";
