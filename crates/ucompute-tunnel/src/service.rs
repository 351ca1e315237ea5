//! Opening tunnels to job replicas

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use ucompute_common::cluster::ClusterApi;
use ucompute_common::job::JobState;
use ucompute_common::net::{Address, IpPool};

use crate::error::TunnelError;
use crate::port::{PortAllocator, ReservedPort};
use crate::registry::SharedTunnelRegistry;
use crate::tunnel::{Tunnel, TunnelBackend};

/// Replica a connector should forward to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Job identifier
    pub job_id: String,
    /// Replica rank
    pub rank: u32,
    /// Pod running the replica
    pub pod: String,
    /// Cluster-internal address of the replica
    pub address: Address,
    /// Port on the replica to forward to
    pub port: u16,
}

/// Sets up the transport for a tunnel
///
/// The connector takes ownership of the reserved listener; the returned
/// backend is responsible for releasing it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Start forwarding `local` to `target`
    async fn connect(
        &self,
        target: &TunnelTarget,
        local: ReservedPort,
    ) -> Result<Arc<dyn TunnelBackend>, TunnelError>;
}

/// Opens tunnels to running replicas and tracks them in a registry
pub struct TunnelService {
    cluster: Arc<dyn ClusterApi>,
    pool: Arc<IpPool>,
    registry: SharedTunnelRegistry,
    connector: Arc<dyn TunnelConnector>,
    ports: PortAllocator,
    target_port: u16,
}

impl TunnelService {
    /// Create a service forwarding to `target_port` on each replica
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        pool: Arc<IpPool>,
        registry: SharedTunnelRegistry,
        connector: Arc<dyn TunnelConnector>,
        target_port: u16,
    ) -> Self {
        Self {
            cluster,
            pool,
            registry,
            connector,
            ports: PortAllocator::default(),
            target_port,
        }
    }

    /// Use a custom port allocator
    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Registry holding the open tunnels
    pub fn registry(&self) -> &SharedTunnelRegistry {
        &self.registry
    }

    /// Open a tunnel to one replica of a running job
    pub async fn open(&self, job_id: &str, rank: u32) -> Result<Arc<Tunnel>, TunnelError> {
        if let Some(existing) = self.registry.get(job_id, rank) {
            if !existing.is_closed() {
                return Err(TunnelError::AlreadyOpen {
                    job_id: job_id.to_string(),
                    rank,
                });
            }
        }

        let placement = self
            .cluster
            .find_replica(job_id, rank)
            .await?
            .ok_or_else(|| TunnelError::ReplicaNotFound {
                job_id: job_id.to_string(),
                rank,
            })?;

        if placement.state != JobState::Running {
            return Err(TunnelError::JobNotRunning {
                job_id: job_id.to_string(),
                rank,
                state: placement.state,
            });
        }

        let reported = placement.address.ok_or_else(|| TunnelError::NoAddress {
            job_id: job_id.to_string(),
            rank,
        })?;
        // Replicas bound to a public address report the external one
        let address = self.pool.to_internal(reported).unwrap_or(reported);

        let local = self.ports.reserve().await?;
        let local_port = local.port();
        let target = TunnelTarget {
            job_id: job_id.to_string(),
            rank,
            pod: placement.pod,
            address,
            port: self.target_port,
        };
        let backend = self.connector.connect(&target, local).await?;

        let tunnel = Arc::new(Tunnel::new(job_id, rank, address, local_port, backend));
        match self.registry.register(Arc::clone(&tunnel)) {
            Ok(tunnel) => {
                info!(
                    job_id,
                    rank,
                    local_port,
                    address = %address,
                    node = %placement.node,
                    "Tunnel opened"
                );
                Ok(tunnel)
            }
            Err(e) => {
                if let Err(close_err) = tunnel.close().await {
                    warn!(job_id, rank, error = %close_err, "Failed to close rejected tunnel");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TunnelRegistry;
    use crate::tunnel::MockTunnelBackend;
    use std::net::{IpAddr, Ipv4Addr};
    use ucompute_common::cluster::JobPlacement;
    use ucompute_common::Error;

    /// Answers replica lookups with a fixed placement
    struct StaticCluster {
        placement: Result<Option<JobPlacement>, &'static str>,
    }

    #[async_trait]
    impl ClusterApi for StaticCluster {
        async fn list_nodes(&self) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }

        async fn cordon_node(&self, _node: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn list_placements_on_node(&self, _node: &str) -> Result<Vec<JobPlacement>, Error> {
            Ok(Vec::new())
        }

        async fn find_replica(&self, _job_id: &str, _rank: u32) -> Result<Option<JobPlacement>, Error> {
            self.placement
                .clone()
                .map_err(|message| Error::cluster("find_replica", message))
        }

        async fn delete_job(&self, _job_id: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn store_pause_state(&self, _paused: bool) -> Result<(), Error> {
            Ok(())
        }

        async fn load_pause_state(&self) -> Result<bool, Error> {
            Ok(false)
        }
    }

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn placement(state: JobState, address: Option<&str>) -> JobPlacement {
        JobPlacement {
            job_id: "42".to_string(),
            rank: 0,
            pod: "j-42-job-0".to_string(),
            node: "node-a".to_string(),
            address: address.map(addr),
            state,
        }
    }

    fn cluster_returning(placement: Option<JobPlacement>) -> StaticCluster {
        StaticCluster {
            placement: Ok(placement),
        }
    }

    fn closing_backend() -> Arc<dyn TunnelBackend> {
        let mut backend = MockTunnelBackend::new();
        backend.expect_close().times(1).returning(|| Ok(()));
        backend.expect_is_alive().returning(|| Ok(true));
        Arc::new(backend)
    }

    fn service(cluster: StaticCluster, connector: MockTunnelConnector) -> TunnelService {
        let pool = IpPool::from_pairs([("130.225.0.0/24", "10.200.0.0/24")]).unwrap();
        TunnelService::new(
            Arc::new(cluster),
            Arc::new(pool),
            Arc::new(TunnelRegistry::new()),
            Arc::new(connector),
            8888,
        )
    }

    #[tokio::test]
    async fn test_open_running_replica() {
        let cluster = cluster_returning(Some(placement(JobState::Running, Some("10.200.0.7"))));
        let mut connector = MockTunnelConnector::new();
        connector
            .expect_connect()
            .withf(|target, _| {
                target.pod == "j-42-job-0" && target.port == 8888 && target.address == "10.200.0.7".parse().unwrap()
            })
            .times(1)
            .returning(|_, _| Ok(closing_backend()));

        let service = service(cluster, connector);
        let tunnel = service.open("42", 0).await.unwrap();
        assert_eq!(tunnel.ip_address(), addr("10.200.0.7"));
        assert_ne!(tunnel.local_port(), 0);
        assert!(service.registry().get("42", 0).is_some());

        service.registry().close_all().await;
    }

    #[tokio::test]
    async fn test_external_address_is_remapped() {
        let cluster = cluster_returning(Some(placement(JobState::Running, Some("130.225.0.9"))));
        let mut connector = MockTunnelConnector::new();
        connector
            .expect_connect()
            .withf(|target, _| target.address == "10.200.0.9".parse().unwrap())
            .returning(|_, _| Ok(closing_backend()));

        let service = service(cluster, connector);
        let tunnel = service.open("42", 0).await.unwrap();
        assert_eq!(tunnel.ip_address(), addr("10.200.0.9"));
        service.registry().close_all().await;
    }

    #[tokio::test]
    async fn test_not_running_is_rejected() {
        let cluster = cluster_returning(Some(placement(JobState::Pending, None)));
        let mut connector = MockTunnelConnector::new();
        connector.expect_connect().never();

        let err = service(cluster, connector).open("42", 0).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::JobNotRunning {
                state: JobState::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_replica() {
        let cluster = cluster_returning(None);
        let mut connector = MockTunnelConnector::new();
        connector.expect_connect().never();

        let err = service(cluster, connector).open("42", 5).await.unwrap_err();
        assert!(matches!(err, TunnelError::ReplicaNotFound { rank: 5, .. }));
    }

    #[tokio::test]
    async fn test_missing_address() {
        let cluster = cluster_returning(Some(placement(JobState::Running, None)));
        let mut connector = MockTunnelConnector::new();
        connector.expect_connect().never();

        let err = service(cluster, connector).open("42", 0).await.unwrap_err();
        assert!(matches!(err, TunnelError::NoAddress { .. }));
    }

    #[tokio::test]
    async fn test_second_open_is_rejected() {
        let cluster = cluster_returning(Some(placement(JobState::Running, Some("10.200.0.7"))));
        let mut connector = MockTunnelConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_, _| Ok(closing_backend()));

        let service = service(cluster, connector);
        service.open("42", 0).await.unwrap();
        let err = service.open("42", 0).await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyOpen { .. }));

        service.registry().close_all().await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let cluster = cluster_returning(Some(placement(JobState::Running, Some("10.200.0.7"))));
        let mut connector = MockTunnelConnector::new();
        connector.expect_connect().returning(|target, _| {
            Err(TunnelError::Connect {
                job_id: target.job_id.clone(),
                message: "forbidden".to_string(),
            })
        });

        let service = service(cluster, connector);
        let err = service.open("42", 0).await.unwrap_err();
        assert!(matches!(err, TunnelError::Connect { .. }));
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cluster_failure_is_propagated() {
        let cluster = StaticCluster {
            placement: Err("connection refused"),
        };
        let connector = MockTunnelConnector::new();

        let err = service(cluster, connector).open("42", 0).await.unwrap_err();
        assert!(matches!(err, TunnelError::Cluster(_)));
    }

    #[tokio::test]
    async fn test_custom_port_allocator_binds_requested_interface() {
        let cluster = cluster_returning(Some(placement(JobState::Running, Some("10.200.0.7"))));
        let mut connector = MockTunnelConnector::new();
        connector
            .expect_connect()
            .withf(|_, local| local.local_addr().ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .times(1)
            .returning(|_, _| Ok(closing_backend()));

        let service = service(cluster, connector)
            .with_port_allocator(PortAllocator::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        let tunnel = service.open("42", 0).await.unwrap();
        assert_ne!(tunnel.local_port(), 0);

        service.registry().close_all().await;
    }
}
