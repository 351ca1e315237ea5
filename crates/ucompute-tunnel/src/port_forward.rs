//! TCP relay backends
//!
//! [`PortForwardBackend`] accepts connections on a reserved local port and
//! hands each one to a forwarding function. Two connectors build on it:
//! [`KubePortForwardConnector`] relays through the API server's pod
//! port-forward subresource, [`DirectConnector`] dials the replica's cluster
//! address and is meant for deployments running inside the cluster network.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::port::ReservedPort;
use crate::service::{TunnelConnector, TunnelTarget};
use crate::tunnel::TunnelBackend;

/// Upper bound on waiting for forwarding tasks during close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts local connections and relays each through a forwarding function
///
/// The backend is alive while its accept loop runs. Liveness is read from
/// that state and never opens a connection.
pub struct PortForwardBackend {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
    accept: JoinHandle<()>,
}

impl PortForwardBackend {
    /// Start accepting on `local`
    ///
    /// `forward` is called once per accepted connection and should return when
    /// the token is cancelled.
    pub fn spawn<F, Fut>(local: ReservedPort, forward: F) -> Self
    where
        F: Fn(TcpStream, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TunnelError>> + Send + 'static,
    {
        let local_addr = local.local_addr();
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        let accept = tasks.spawn(accept_loop(
            local.into_listener(),
            forward,
            cancel.clone(),
            tasks.clone(),
        ));

        Self {
            local_addr,
            cancel,
            tasks,
            accept,
        }
    }

    /// Address the backend accepts on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    forward: F,
    cancel: CancellationToken,
    tasks: TaskTracker,
) where
    F: Fn(TcpStream, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TunnelError>> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted tunnel connection");
                    let connection = forward(stream, cancel.child_token());
                    tasks.spawn(async move {
                        if let Err(e) = connection.await {
                            debug!(%peer, error = %e, "Forwarded connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Tunnel listener failed");
                    break;
                }
            },
        }
    }

    // Also stops in-flight connections when the listener itself failed
    cancel.cancel();
}

#[async_trait]
impl TunnelBackend for PortForwardBackend {
    async fn is_alive(&self) -> Result<bool, TunnelError> {
        Ok(!self.cancel.is_cancelled() && !self.accept.is_finished())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.cancel.cancel();
        self.tasks.close();
        timeout(CLOSE_TIMEOUT, self.tasks.wait()).await.map_err(|_| {
            TunnelError::Backend(format!(
                "forwarding tasks on {} still running after {:?}",
                self.local_addr, CLOSE_TIMEOUT
            ))
        })
    }
}

/// Relays connections through the API server's pod port-forward
#[derive(Clone)]
pub struct KubePortForwardConnector {
    pods: Api<Pod>,
}

impl KubePortForwardConnector {
    /// Connector for pods in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl TunnelConnector for KubePortForwardConnector {
    async fn connect(
        &self,
        target: &TunnelTarget,
        local: ReservedPort,
    ) -> Result<Arc<dyn TunnelBackend>, TunnelError> {
        // Fail early if the pod is gone rather than on the first connection
        self.pods
            .get_opt(&target.pod)
            .await
            .map_err(|e| TunnelError::Connect {
                job_id: target.job_id.clone(),
                message: e.to_string(),
            })?
            .ok_or_else(|| TunnelError::Connect {
                job_id: target.job_id.clone(),
                message: format!("pod {} not found", target.pod),
            })?;

        info!(
            pod = %target.pod,
            port = target.port,
            local_port = local.port(),
            "Starting pod port-forward"
        );

        let pods = self.pods.clone();
        let pod = target.pod.clone();
        let port = target.port;
        let backend = PortForwardBackend::spawn(local, move |stream, cancel| {
            forward_to_pod(pods.clone(), pod.clone(), port, stream, cancel)
        });
        Ok(Arc::new(backend))
    }
}

async fn forward_to_pod(
    pods: Api<Pod>,
    pod: String,
    port: u16,
    mut client: TcpStream,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let mut forwarder = pods
        .portforward(&pod, &[port])
        .await
        .map_err(|e| TunnelError::Backend(format!("port-forward to {pod}: {e}")))?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| TunnelError::Backend(format!("port-forward to {pod} has no stream")))?;

    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        copied = copy_bidirectional(&mut client, &mut upstream) => match copied {
            Ok((sent, received)) => {
                debug!(%pod, sent, received, "Port-forward connection finished");
                Ok(())
            }
            Err(e) => Err(TunnelError::Backend(e.to_string())),
        },
    };

    drop(upstream);
    forwarder.abort();
    result
}

/// Relays connections straight to the replica's cluster address
#[derive(Clone, Debug)]
pub struct DirectConnector {
    connect_timeout: Duration,
}

impl Default for DirectConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DirectConnector {
    /// Override how long dialing the replica may take per connection
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl TunnelConnector for DirectConnector {
    async fn connect(
        &self,
        target: &TunnelTarget,
        local: ReservedPort,
    ) -> Result<Arc<dyn TunnelBackend>, TunnelError> {
        let upstream = SocketAddr::from((Ipv4Addr::from(target.address), target.port));
        info!(%upstream, local_port = local.port(), "Starting direct relay");

        let connect_timeout = self.connect_timeout;
        let backend = PortForwardBackend::spawn(local, move |stream, cancel| {
            relay(stream, upstream, connect_timeout, cancel)
        });
        Ok(Arc::new(backend))
    }
}

async fn relay(
    mut client: TcpStream,
    upstream: SocketAddr,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let mut server = timeout(connect_timeout, TcpStream::connect(upstream))
        .await
        .map_err(|_| TunnelError::Backend(format!("connect to {upstream} timed out")))?
        .map_err(|e| TunnelError::Backend(format!("connect to {upstream}: {e}")))?;

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        copied = copy_bidirectional(&mut client, &mut server) => copied
            .map(|_| ())
            .map_err(|e| TunnelError::Backend(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortAllocator;
    use crate::tunnel::Tunnel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn target(upstream: SocketAddr) -> TunnelTarget {
        let std::net::IpAddr::V4(ip) = upstream.ip() else {
            panic!("expected IPv4");
        };
        TunnelTarget {
            job_id: "42".to_string(),
            rank: 0,
            pod: "j-42-job-0".to_string(),
            address: ip.into(),
            port: upstream.port(),
        }
    }

    #[tokio::test]
    async fn test_direct_relay_round_trip() {
        let upstream = echo_server().await;
        let local = PortAllocator::default().reserve().await.unwrap();
        let local_port = local.port();

        let backend = DirectConnector::default()
            .connect(&target(upstream), local)
            .await
            .unwrap();
        assert!(backend.is_alive().await.unwrap());

        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        let upstream = echo_server().await;
        let local = PortAllocator::default().reserve().await.unwrap();
        let local_port = local.port();

        let backend = DirectConnector::default()
            .connect(&target(upstream), local)
            .await
            .unwrap();
        let tunnel = Tunnel::new("42", 0, "127.0.0.1".parse().unwrap(), local_port, backend);
        assert!(tunnel.is_alive().await);

        tunnel.close().await.unwrap();
        assert!(!tunnel.is_alive().await);
        assert!(TcpStream::connect(("127.0.0.1", local_port)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_stops_open_connections() {
        let upstream = echo_server().await;
        let local = PortAllocator::default().reserve().await.unwrap();
        let local_port = local.port();

        let backend = DirectConnector::default()
            .connect(&target(upstream), local)
            .await
            .unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        backend.close().await.unwrap();

        // The relay dropped its half, so the client sees EOF
        let n = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_liveness_checks_do_not_dial_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok(_conn) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let local = PortAllocator::default().reserve().await.unwrap();
        let backend = DirectConnector::default()
            .connect(&target(upstream), local)
            .await
            .unwrap();
        for _ in 0..3 {
            assert!(backend.is_alive().await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 0);

        backend.close().await.unwrap();
        assert!(!backend.is_alive().await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_timeout_is_configurable() {
        let local = PortAllocator::default().reserve().await.unwrap();
        let local_port = local.port();
        // Nothing listens on the discard port of a TEST-NET-1 address
        let unreachable = TunnelTarget {
            address: "192.0.2.1".parse().unwrap(),
            port: 9,
            ..target("127.0.0.1:1".parse().unwrap())
        };
        let backend = DirectConnector::default()
            .with_connect_timeout(Duration::from_millis(50))
            .connect(&unreachable, local)
            .await
            .unwrap();

        // The relay gives up on the upstream and drops the client
        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(backend.is_alive().await.unwrap());

        backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_errors_do_not_stop_accepting() {
        let local = PortAllocator::default().reserve().await.unwrap();
        let addr = local.local_addr();
        let backend = PortForwardBackend::spawn(local, |_stream, _cancel| async {
            Err(TunnelError::Backend("upstream refused".to_string()))
        });

        TcpStream::connect(addr).await.unwrap();
        TcpStream::connect(addr).await.unwrap();
        assert!(backend.is_alive().await.unwrap());
        backend.close().await.unwrap();
        assert!(!backend.is_alive().await.unwrap());
    }
}
