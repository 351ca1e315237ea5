//! Error types shared across ucompute crates
//!
//! Errors carry the operation or resource they relate to so that a failed
//! drain or kill can be traced back to the exact cluster call.

use thiserror::Error;

use crate::net::NetError;

/// Main error type for cluster-facing operations
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster API could not be reached or rejected the call
    #[error("cluster unavailable during {operation}: {message}")]
    ClusterUnavailable {
        /// Operation that was attempted (e.g. "delete_job", "cordon_node")
        operation: String,
        /// Description of the failure
        message: String,
    },

    /// A resource the caller referred to does not exist
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Kind of resource (e.g. "job", "node")
        kind: String,
        /// Name or identifier that was looked up
        name: String,
    },

    /// Address or subnet handling failed
    #[error(transparent)]
    Net(#[from] NetError),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "watcher", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a cluster-unavailable error for the given operation
    pub fn cluster(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ClusterUnavailable { .. })
    }

    /// Whether this error means the resource is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Map a kube-rs error about `kind`/`name` onto our error kinds.
    ///
    /// A 404 from the API server becomes [`Error::NotFound`]; everything else
    /// is treated as the cluster being unavailable.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::not_found(kind, name),
            _ => Self::cluster(format!("{kind} {name}"), err.to_string()),
        }
    }
}
