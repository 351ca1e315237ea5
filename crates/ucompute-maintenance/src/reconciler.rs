//! Job-event reconciliation
//!
//! Tunnels only make sense while their replica is Running. The reconciler
//! watches job events and closes tunnels as soon as what they point at leaves
//! that state. Job-wide events act on every rank; replica events only act on
//! the rank they name, so one worker finishing early leaves the others alone.

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ucompute_common::job::{JobEvent, JobState};
use ucompute_tunnel::{CloseReport, SharedTunnelRegistry, TunnelKey};

/// Job id plus the rank for replica-scoped state, `None` for the job itself
type StateKey = (String, Option<u32>);

/// Closes tunnels of jobs and replicas that stopped running
pub struct JobEventReconciler {
    tunnels: SharedTunnelRegistry,
    /// Last known state per job and per replica; terminal entries are dropped
    states: DashMap<StateKey, JobState>,
}

impl JobEventReconciler {
    /// Create a reconciler acting on `tunnels`
    pub fn new(tunnels: SharedTunnelRegistry) -> Self {
        Self {
            tunnels,
            states: DashMap::new(),
        }
    }

    /// Last job-wide state seen for a job, if it is still tracked
    pub fn state_of(&self, job_id: &str) -> Option<JobState> {
        self.states
            .get(&(job_id.to_string(), None))
            .map(|s| *s.value())
    }

    /// Last state seen for one replica, if it is still tracked
    pub fn replica_state_of(&self, job_id: &str, rank: u32) -> Option<JobState> {
        self.states
            .get(&(job_id.to_string(), Some(rank)))
            .map(|s| *s.value())
    }

    /// React to one job event
    ///
    /// Returns the tunnels closed as a consequence, if any were.
    pub async fn handle(&self, event: &JobEvent) -> Option<CloseReport> {
        let Some(job_id) = event.job_id() else {
            debug!(job_name = %event.job_name, "Ignoring event for non-job resource");
            return None;
        };

        let key: StateKey = (job_id.to_string(), event.rank);
        let next = JobState::from_condition(&event.condition);
        let previous = if next.is_terminal() {
            let previous = self.states.remove(&key).map(|(_, s)| s);
            if event.rank.is_none() {
                self.states.retain(|(id, _), _| id != job_id);
            }
            previous
        } else {
            self.states.insert(key, next)
        };

        if previous != Some(next) {
            debug!(job_id, rank = ?event.rank, from = ?previous, to = %next, "Job state changed");
        }
        if previous.is_some_and(|p| !p.can_transition_to(next)) {
            debug!(job_id, rank = ?event.rank, from = ?previous, to = %next, "Unexpected job state transition");
        }

        if event.condition.is_failed {
            warn!(
                job_id,
                rank = ?event.rank,
                reason = event.condition.reason.as_deref().unwrap_or("unknown"),
                "Job failed"
            );
        }

        let left_running = previous == Some(JobState::Running) && next != JobState::Running;
        if !(left_running || next.is_terminal()) {
            return None;
        }

        let report = match event.rank {
            None => self.tunnels.close_job(job_id).await,
            Some(rank) => {
                let target = TunnelKey::new(job_id, rank);
                self.tunnels.close_where(|key| *key == target).await
            }
        };
        if report.total() > 0 {
            info!(
                job_id,
                rank = ?event.rank,
                state = %next,
                closed = report.closed.len(),
                failed = report.failed.len(),
                "Closed tunnels of stopped job"
            );
        }
        Some(report)
    }

    /// Consume job events until the stream ends or `cancel` fires
    pub async fn run<S>(&self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = JobEvent> + Send,
    {
        futures::pin_mut!(events);
        info!("Job event reconciler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Job event reconciler stopping");
                    break;
                }
                next = events.next() => match next {
                    Some(event) => {
                        self.handle(&event).await;
                    }
                    None => {
                        info!("Job event stream ended");
                        break;
                    }
                },
            }
        }
    }
}
