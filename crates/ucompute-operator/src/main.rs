//! ucompute - maintenance and tunnel CLI for the compute job cluster

mod config;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use ucompute_common::cluster::{job_event_from_pod, KubeClusterApi};
use ucompute_common::job::JobEvent;
use ucompute_common::net::IpPool;
use ucompute_common::retry::RetryConfig;
use ucompute_common::telemetry::{init_telemetry, TelemetryConfig};
use ucompute_common::JOB_ID_LABEL;
use ucompute_maintenance::{JobEventReconciler, Maintenance, PauseState};
use ucompute_tunnel::{
    DirectConnector, KubePortForwardConnector, PortAllocator, TunnelConnector, TunnelRegistry,
    TunnelService,
};

use crate::config::{Cli, Commands, TunnelArgs, TunnelMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json: cli.json_logs,
        ..Default::default()
    })?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let cluster = Arc::new(
        KubeClusterApi::new(client.clone(), &cli.namespace)
            .with_pause_configmap(&cli.pause_configmap)
            .with_retry(RetryConfig::with_max_attempts(cli.retry_attempts)),
    );
    let registry = Arc::new(TunnelRegistry::new());
    let maintenance = Maintenance::new(cluster.clone(), Arc::clone(&registry), PauseState::default());

    match cli.command {
        Commands::Tunnel(args) => {
            maintenance.load_pause_state().await?;
            run_tunnels(client, &cli.namespace, cluster, registry, args).await
        }
        Commands::Drain { node: Some(node) } => {
            let report = maintenance.drain_node(&node).await?;
            println!(
                "drained {}: {} job(s) deleted, {} failed",
                report.node,
                report.jobs_deleted.len(),
                report.jobs_failed.len()
            );
            for (job_id, e) in &report.jobs_failed {
                println!("  {job_id}: {e}");
            }
            ensure_complete(report.is_complete())
        }
        Commands::Drain { node: None } => {
            let report = maintenance.drain_cluster().await?;
            for drained in &report.nodes {
                println!(
                    "drained {}: {} job(s) deleted, {} failed",
                    drained.node,
                    drained.jobs_deleted.len(),
                    drained.jobs_failed.len()
                );
            }
            for (node, e) in &report.failed_nodes {
                println!("failed to drain {node}: {e}");
            }
            ensure_complete(report.is_complete())
        }
        Commands::Kill { job_id } => {
            let report = maintenance.kill_job(&job_id).await?;
            if report.deleted {
                println!("job {job_id} killed");
            } else {
                println!("job {job_id} was already gone");
            }
            Ok(())
        }
        Commands::Pause => {
            maintenance.set_pause_state(true).await?;
            println!("scheduling paused");
            Ok(())
        }
        Commands::Resume => {
            maintenance.set_pause_state(false).await?;
            println!("scheduling resumed");
            Ok(())
        }
        Commands::Status { ip_pool } => {
            let paused = maintenance.load_pause_state().await?;
            let pool = build_pool(&ip_pool)?;
            let status = pool.status();
            println!("paused: {paused}");
            println!("ip pool: {} address(es), {} in use", status.capacity, status.used);
            for entry in pool.entries() {
                println!("  {} -> {}", entry.external, entry.internal);
            }
            Ok(())
        }
    }
}

fn ensure_complete(complete: bool) -> anyhow::Result<()> {
    if complete {
        Ok(())
    } else {
        anyhow::bail!("drain finished with failures")
    }
}

fn build_pool(entries: &[(String, String)]) -> anyhow::Result<IpPool> {
    IpPool::from_pairs(entries.iter().map(|(e, i)| (e.as_str(), i.as_str())))
        .context("invalid IP pool configuration")
}

/// Open the requested tunnels and keep them until interrupted
///
/// A pod watch feeds the reconciler so tunnels close when their job stops;
/// a periodic sweep closes tunnels whose forwarding died.
async fn run_tunnels(
    client: Client,
    namespace: &str,
    cluster: Arc<KubeClusterApi>,
    registry: Arc<TunnelRegistry>,
    args: TunnelArgs,
) -> anyhow::Result<()> {
    let pool = Arc::new(build_pool(&args.ip_pool)?);
    let connector: Arc<dyn TunnelConnector> = match args.mode {
        TunnelMode::PortForward => Arc::new(KubePortForwardConnector::new(client.clone(), namespace)),
        TunnelMode::Direct => {
            Arc::new(DirectConnector::default().with_connect_timeout(args.connect_timeout()))
        }
    };
    let service = TunnelService::new(cluster, pool, Arc::clone(&registry), connector, args.target_port)
        .with_port_allocator(PortAllocator::new(args.bind_address));

    for rank in &args.ranks {
        match service.open(&args.job_id, *rank).await {
            Ok(tunnel) => println!(
                "job {} rank {}: {}:{} -> {}:{}",
                args.job_id,
                rank,
                args.bind_address,
                tunnel.local_port(),
                tunnel.ip_address(),
                args.target_port
            ),
            Err(e) => {
                registry.close_all().await;
                return Err(e).with_context(|| format!("failed to open tunnel to rank {rank}"));
            }
        }
    }

    let cancel = CancellationToken::new();
    let reconciler = JobEventReconciler::new(Arc::clone(&registry));
    let events = job_events(Api::namespaced(client, namespace));

    let reaper = {
        let registry = Arc::clone(&registry);
        let mut interval = tokio::time::interval(args.reap_interval());
        async move {
            loop {
                interval.tick().await;
                let reaped = registry.reap_dead().await;
                for key in &reaped {
                    tracing::warn!(tunnel = %key, "Tunnel stopped forwarding and was closed");
                }
                if registry.is_empty() {
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = reconciler.run(events, cancel.clone()) => {
            tracing::info!("Job event stream finished");
        }
        _ = reaper => {
            tracing::info!("No tunnels left open");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing tunnels");
        }
    }
    cancel.cancel();

    let report = registry.close_all().await;
    tracing::info!(
        closed = report.closed.len(),
        failed = report.failed.len(),
        "Tunnels closed"
    );
    Ok(())
}

/// Job events derived from a watch over job pods
fn job_events(pods: Api<Pod>) -> impl Stream<Item = JobEvent> + Send {
    watcher(pods, watcher::Config::default().labels(JOB_ID_LABEL))
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                    job_event_from_pod(&pod, false)
                }
                Ok(watcher::Event::Delete(pod)) => job_event_from_pod(&pod, true),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Pod watch error");
                    None
                }
            }
        })
}
