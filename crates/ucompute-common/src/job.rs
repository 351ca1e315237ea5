//! Job model shared by the tunnel and maintenance layers
//!
//! Jobs move through a small state machine:
//! Pending → Running → Succeeded/Failed/Killed
//!
//! The cluster reports job progress as [`JobEvent`]s carrying a
//! [`JobCondition`]; [`JobState::from_condition`] turns those into states.

use serde::{Deserialize, Serialize};

/// Prefix of every job's cluster resource name
const JOB_NAME_PREFIX: &str = "j-";

/// Lifecycle state of a job
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Job is waiting to be scheduled
    #[default]
    Pending,
    /// Job has running replicas
    Running,
    /// Job completed successfully
    Succeeded,
    /// Job has encountered an error
    Failed,
    /// Job was cancelled, evicted or deleted
    Killed,
}

impl JobState {
    /// Whether the job can never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// Staying in the same state is always allowed. Terminal states are final.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (Self::Pending, _) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// Derive the state reported by a condition.
    ///
    /// Condition types follow the Volcano job phases. Unknown types fall back
    /// to the active flag: active means Running, inactive means Killed.
    pub fn from_condition(condition: &JobCondition) -> Self {
        if condition.is_failed {
            return Self::Failed;
        }

        match condition.type_.as_str() {
            "Pending" | "Restarting" => Self::Pending,
            "Running" => Self::Running,
            "Completing" | "Completed" | "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Aborting" | "Aborted" | "Terminating" | "Terminated" | "Killed" => Self::Killed,
            _ if condition.is_active => Self::Running,
            _ => Self::Killed,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Condition of a job as reported by the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    /// Condition type (e.g. "Running", "Completed")
    #[serde(rename = "type")]
    pub type_: String,
    /// Machine-readable reason, if any
    #[serde(default)]
    pub reason: Option<String>,
    /// Whether the job still has live replicas
    pub is_active: bool,
    /// Whether the job ended in failure
    pub is_failed: bool,
}

impl JobCondition {
    /// Condition for a job that is still going
    pub fn active(type_: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            reason: None,
            is_active: true,
            is_failed: false,
        }
    }

    /// Condition for a job that has stopped
    pub fn inactive(type_: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            type_: type_.into(),
            reason,
            is_active: false,
            is_failed: false,
        }
    }

    /// Condition for a job that failed
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            type_: "Failed".to_string(),
            reason: Some(reason.into()),
            is_active: false,
            is_failed: true,
        }
    }
}

/// A change in a job's condition, keyed by the job's cluster name
///
/// Events with a `rank` describe a single replica and say nothing about the
/// job's other ranks. Events without one describe the job as a whole.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// Cluster resource name of the job (see [`job_id_to_job_name`])
    pub job_name: String,
    /// Replica the event is about, if it is not job-wide
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    /// The job's new condition
    pub condition: JobCondition,
}

impl JobEvent {
    /// Event about the whole job
    pub fn job(job_name: impl Into<String>, condition: JobCondition) -> Self {
        Self {
            job_name: job_name.into(),
            rank: None,
            condition,
        }
    }

    /// Event about one replica of the job
    pub fn replica(job_name: impl Into<String>, rank: u32, condition: JobCondition) -> Self {
        Self {
            job_name: job_name.into(),
            rank: Some(rank),
            condition,
        }
    }

    /// Job identifier encoded in the job name, if it follows the naming scheme
    pub fn job_id(&self) -> Option<&str> {
        job_name_to_job_id(&self.job_name)
    }
}

/// Cluster resource name for a job identifier
pub fn job_id_to_job_name(job_id: &str) -> String {
    format!("{JOB_NAME_PREFIX}{job_id}")
}

/// Job identifier for a cluster resource name
pub fn job_name_to_job_id(job_name: &str) -> Option<&str> {
    job_name
        .strip_prefix(JOB_NAME_PREFIX)
        .filter(|id| !id.is_empty())
}
