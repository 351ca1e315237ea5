//! Maintenance surface for the compute cluster
//!
//! - [`PauseState`] - shared flag gating new scheduling actions
//! - [`Maintenance`] - drain nodes, drain the cluster, kill jobs, toggle pause
//! - [`JobEventReconciler`] - closes tunnels when jobs stop running
//!
//! Every operation that stops a job also closes the tunnels pointing at it,
//! through the shared [`TunnelRegistry`](ucompute_tunnel::TunnelRegistry).

#![deny(missing_docs)]

pub mod error;
pub mod maintenance;
pub mod pause;
pub mod reconciler;

pub use error::MaintenanceError;
pub use maintenance::{ClusterDrainReport, DrainReport, KillReport, Maintenance};
pub use pause::PauseState;
pub use reconciler::JobEventReconciler;
