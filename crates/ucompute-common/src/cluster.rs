//! Cluster API collaborator
//!
//! [`ClusterApi`] is everything the tunnel and maintenance layers need from the
//! cluster: where job replicas run, how to evacuate a node, how to delete a
//! job, and where the maintenance pause flag is persisted. [`KubeClusterApi`]
//! implements it with kube-rs against job pods labelled with
//! [`JOB_ID_LABEL`](crate::JOB_ID_LABEL) and [`RANK_LABEL`](crate::RANK_LABEL).

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams,
};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::job::{job_id_to_job_name, JobCondition, JobEvent, JobState};
use crate::net::{parse_ip_address, Address};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, JOB_ID_LABEL, RANK_LABEL};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "ucompute-maintenance";

/// ConfigMap key holding the pause flag
const PAUSED_KEY: &str = "paused";

/// Where one replica of a job runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobPlacement {
    /// Job identifier
    pub job_id: String,
    /// Replica rank within the job
    pub rank: u32,
    /// Name of the pod running the replica
    pub pod: String,
    /// Node the replica is scheduled on
    pub node: String,
    /// Container address, once one has been assigned
    pub address: Option<Address>,
    /// State of this replica
    pub state: JobState,
}

/// Trait abstracting the cluster operations used by ucompute
///
/// Implemented by [`KubeClusterApi`] in production and by in-memory doubles
/// in tests. Implementations must tolerate transient failures and report
/// persistent ones as [`Error::ClusterUnavailable`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of all schedulable and unschedulable nodes
    async fn list_nodes(&self) -> Result<Vec<String>, Error>;

    /// Mark a node unschedulable so no new replicas land on it
    async fn cordon_node(&self, node: &str) -> Result<(), Error>;

    /// Every job replica currently placed on `node`
    async fn list_placements_on_node(&self, node: &str) -> Result<Vec<JobPlacement>, Error>;

    /// Placement of one replica, or `None` if it does not exist
    async fn find_replica(&self, job_id: &str, rank: u32) -> Result<Option<JobPlacement>, Error>;

    /// Delete a job and all of its replicas
    ///
    /// Returns [`Error::NotFound`] if the job does not exist.
    async fn delete_job(&self, job_id: &str) -> Result<(), Error>;

    /// Persist the maintenance pause flag
    async fn store_pause_state(&self, paused: bool) -> Result<(), Error>;

    /// Read the persisted maintenance pause flag (false if never stored)
    async fn load_pause_state(&self) -> Result<bool, Error>;
}

/// Real Kubernetes implementation of [`ClusterApi`]
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
    pause_configmap: String,
    retry: RetryConfig,
}

impl KubeClusterApi {
    /// Create a new KubeClusterApi for job pods in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            pause_configmap: crate::DEFAULT_PAUSE_CONFIGMAP.to_string(),
            retry: RetryConfig::default(),
        }
    }

    /// Use a different ConfigMap for the pause flag
    pub fn with_pause_configmap(mut self, name: impl Into<String>) -> Self {
        self.pause_configmap = name.into();
        self
    }

    /// Use a different retry policy for cluster calls
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn volcano_jobs(&self) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            &self.namespace,
            &ApiResource::from_gvk(&GroupVersionKind {
                group: "batch.volcano.sh".to_string(),
                version: "v1alpha1".to_string(),
                kind: "Job".to_string(),
            }),
        )
    }

    async fn list_job_pods(&self, lp: ListParams, what: &str) -> Result<Vec<Pod>, Error> {
        let api = self.pods();
        let pods = retry_with_backoff(&self.retry, "list_pods", is_transient, || api.list(&lp))
            .await
            .map_err(|e| Error::from_kube("pods", what, e))?;
        Ok(pods.items)
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<String>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let lp = ListParams::default();
        let nodes = retry_with_backoff(&self.retry, "list_nodes", is_transient, || api.list(&lp))
            .await
            .map_err(|e| Error::from_kube("nodes", "*", e))?;

        Ok(nodes.items.iter().map(|n| n.name_any()).collect())
    }

    async fn cordon_node(&self, node: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let body = serde_json::json!({ "spec": { "unschedulable": true } });
        let patch = Patch::Merge(&body);
        let pp = PatchParams::default();

        retry_with_backoff(&self.retry, "cordon_node", is_transient, || {
            api.patch(node, &pp, &patch)
        })
        .await
        .map_err(|e| Error::from_kube("node", node, e))?;

        info!(node = %node, "Cordoned node");
        Ok(())
    }

    async fn list_placements_on_node(&self, node: &str) -> Result<Vec<JobPlacement>, Error> {
        let lp = ListParams::default()
            .labels(JOB_ID_LABEL)
            .fields(&format!("spec.nodeName={node}"));
        let pods = self.list_job_pods(lp, node).await?;

        Ok(pods.iter().filter_map(placement_from_pod).collect())
    }

    async fn find_replica(&self, job_id: &str, rank: u32) -> Result<Option<JobPlacement>, Error> {
        let lp = ListParams::default().labels(&format!("{JOB_ID_LABEL}={job_id},{RANK_LABEL}={rank}"));
        let pods = self.list_job_pods(lp, job_id).await?;

        Ok(pods.iter().find_map(placement_from_pod))
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), Error> {
        let api = self.volcano_jobs();
        let name = job_id_to_job_name(job_id);
        let dp = DeleteParams::background();

        retry_with_backoff(&self.retry, "delete_job", is_transient, || api.delete(&name, &dp))
            .await
            .map_err(|e| Error::from_kube("job", job_id, e))?;

        info!(job_id = %job_id, job_name = %name, "Deleted job");
        Ok(())
    }

    async fn store_pause_state(&self, paused: bool) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let configmap = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": self.pause_configmap },
            "data": { "paused": paused.to_string() },
        });
        let patch = Patch::Apply(&configmap);
        let pp = PatchParams::apply(FIELD_MANAGER).force();

        retry_with_backoff(&self.retry, "store_pause_state", is_transient, || {
            api.patch(&self.pause_configmap, &pp, &patch)
        })
        .await
        .map_err(|e| Error::from_kube("configmap", &self.pause_configmap, e))?;

        debug!(paused = paused, configmap = %self.pause_configmap, "Stored pause state");
        Ok(())
    }

    async fn load_pause_state(&self) -> Result<bool, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let configmap = retry_with_backoff(&self.retry, "load_pause_state", is_transient, || {
            api.get_opt(&self.pause_configmap)
        })
        .await
        .map_err(|e| Error::from_kube("configmap", &self.pause_configmap, e))?;

        Ok(configmap
            .and_then(|cm| cm.data)
            .map(|data| paused_from_data(&data))
            .unwrap_or(false))
    }
}

/// Whether a kube error is worth retrying
fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code == 429 || resp.code >= 500,
        _ => true,
    }
}

fn paused_from_data(data: &BTreeMap<String, String>) -> bool {
    data.get(PAUSED_KEY).map(|v| v == "true").unwrap_or(false)
}

/// State of one replica derived from its pod
pub fn pod_state(pod: &Pod) -> JobState {
    if pod.metadata.deletion_timestamp.is_some() {
        return JobState::Killed;
    }

    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => JobState::Running,
        Some("Succeeded") => JobState::Succeeded,
        Some("Failed") => JobState::Failed,
        _ => JobState::Pending,
    }
}

/// Build a placement from a job pod; `None` if the pod lacks job labels or a node
pub fn placement_from_pod(pod: &Pod) -> Option<JobPlacement> {
    let labels = pod.metadata.labels.as_ref()?;
    let job_id = labels.get(JOB_ID_LABEL)?.clone();
    let rank = labels
        .get(RANK_LABEL)
        .map(|r| r.parse::<u32>().ok())
        .unwrap_or(Some(0))?;
    let node = pod.spec.as_ref()?.node_name.clone()?;
    let address = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| parse_ip_address(ip).ok());

    Some(JobPlacement {
        job_id,
        rank,
        pod: pod.name_any(),
        node,
        address,
        state: pod_state(pod),
    })
}

/// Translate a pod watch event into a job event
///
/// The event is scoped to the pod's rank. `deleted` is true when the pod
/// disappeared from the cluster. Pods without a job label or with a malformed
/// rank label produce no event.
pub fn job_event_from_pod(pod: &Pod, deleted: bool) -> Option<JobEvent> {
    let job_id = pod.labels().get(JOB_ID_LABEL)?;
    let rank = match pod.labels().get(RANK_LABEL) {
        Some(rank) => rank.parse::<u32>().ok()?,
        None => 0,
    };
    let reason = pod.status.as_ref().and_then(|s| s.reason.clone());

    let condition = if deleted {
        JobCondition::inactive("Killed", Some("PodDeleted".to_string()))
    } else {
        match pod_state(pod) {
            JobState::Pending => JobCondition::active("Pending"),
            JobState::Running => JobCondition::active("Running"),
            JobState::Succeeded => JobCondition::inactive("Completed", reason),
            JobState::Failed => JobCondition::failed(reason.unwrap_or_else(|| "PodFailed".into())),
            JobState::Killed => JobCondition::inactive("Terminating", reason),
        }
    };

    Some(JobEvent::replica(job_id_to_job_name(job_id), rank, condition))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn job_pod(job_id: &str, rank: &str, node: Option<&str>, phase: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("j-{job_id}-job-{rank}")),
                labels: Some(BTreeMap::from([
                    (JOB_ID_LABEL.to_string(), job_id.to_string()),
                    (RANK_LABEL.to_string(), rank.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_placement_from_running_pod() {
        let pod = job_pod("42", "1", Some("node-a"), "Running", Some("10.0.3.17"));
        let placement = placement_from_pod(&pod).unwrap();
        assert_eq!(placement.job_id, "42");
        assert_eq!(placement.rank, 1);
        assert_eq!(placement.pod, "j-42-job-1");
        assert_eq!(placement.node, "node-a");
        assert_eq!(placement.address.unwrap().to_string(), "10.0.3.17");
        assert_eq!(placement.state, JobState::Running);
    }

    #[test]
    fn test_placement_requires_node_and_valid_rank() {
        assert!(placement_from_pod(&job_pod("42", "0", None, "Pending", None)).is_none());
        assert!(placement_from_pod(&job_pod("42", "x", Some("n"), "Running", None)).is_none());
    }

    #[test]
    fn test_placement_of_pending_pod_has_no_address() {
        let placement = placement_from_pod(&job_pod("7", "0", Some("n"), "Pending", None)).unwrap();
        assert_eq!(placement.address, None);
        assert_eq!(placement.state, JobState::Pending);
    }

    #[test]
    fn test_terminating_pod_is_killed() {
        let mut pod = job_pod("7", "0", Some("n"), "Running", Some("10.0.0.9"));
        pod.metadata.deletion_timestamp = Some(Time(Default::default()));
        assert_eq!(pod_state(&pod), JobState::Killed);
    }

    #[test]
    fn test_job_event_from_pod() {
        let pod = job_pod("42", "0", Some("n"), "Running", Some("10.0.0.9"));
        let event = job_event_from_pod(&pod, false).unwrap();
        assert_eq!(event.job_name, "j-42");
        assert_eq!(event.rank, Some(0));
        assert_eq!(JobState::from_condition(&event.condition), JobState::Running);

        let worker = job_pod("42", "3", Some("n"), "Succeeded", None);
        assert_eq!(job_event_from_pod(&worker, false).unwrap().rank, Some(3));
        assert!(job_event_from_pod(&job_pod("42", "x", Some("n"), "Running", None), false).is_none());

        let event = job_event_from_pod(&pod, true).unwrap();
        assert_eq!(JobState::from_condition(&event.condition), JobState::Killed);

        let failed = job_pod("42", "0", Some("n"), "Failed", None);
        let event = job_event_from_pod(&failed, false).unwrap();
        assert!(event.condition.is_failed);
        assert_eq!(JobState::from_condition(&event.condition), JobState::Failed);
    }

    #[test]
    fn test_unlabelled_pod_is_ignored() {
        let pod = Pod::default();
        assert!(job_event_from_pod(&pod, false).is_none());
        assert!(placement_from_pod(&pod).is_none());
    }

    #[test]
    fn test_paused_from_data() {
        let data = BTreeMap::from([(PAUSED_KEY.to_string(), "true".to_string())]);
        assert!(paused_from_data(&data));
        assert!(!paused_from_data(&BTreeMap::new()));
    }

    #[test]
    fn test_transient_errors() {
        let resp = |code| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: String::new(),
                reason: String::new(),
                code,
            })
        };
        assert!(is_transient(&resp(503)));
        assert!(is_transient(&resp(429)));
        assert!(!is_transient(&resp(404)));
        assert!(!is_transient(&resp(409)));
    }
}
