//! Command-line and environment configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use ucompute_common::{DEFAULT_JOB_NAMESPACE, DEFAULT_PAUSE_CONFIGMAP};

/// ucompute - maintenance and tunnels for the compute job cluster
#[derive(Parser, Debug)]
#[command(name = "ucompute", version, about, long_about = None)]
pub struct Cli {
    /// Namespace where job pods run
    #[arg(long, env = "UCOMPUTE_NAMESPACE", default_value = DEFAULT_JOB_NAMESPACE, global = true)]
    pub namespace: String,

    /// ConfigMap persisting the maintenance pause flag
    #[arg(long, env = "UCOMPUTE_PAUSE_CONFIGMAP", default_value = DEFAULT_PAUSE_CONFIGMAP, global = true)]
    pub pause_configmap: String,

    /// Attempts per cluster call before giving up
    #[arg(long, env = "UCOMPUTE_RETRY_ATTEMPTS", default_value_t = 5, global = true)]
    pub retry_attempts: u32,

    /// Emit JSON log lines
    #[arg(long, env = "UCOMPUTE_JSON_LOGS", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Operations exposed by the binary
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open tunnels to job replicas and keep them until interrupted
    ///
    /// Tunnels close on their own when the job stops running or the
    /// forwarding dies.
    Tunnel(TunnelArgs),

    /// Cordon a node and evacuate its jobs, or the whole cluster
    Drain {
        /// Node to drain; drains every node and pauses scheduling when omitted
        #[arg(long)]
        node: Option<String>,
    },

    /// Terminate a job
    Kill {
        /// Job identifier
        job_id: String,
    },

    /// Stop accepting new work
    Pause,

    /// Accept new work again
    Resume,

    /// Show the pause flag and IP pool usage
    Status {
        /// Public/internal subnet pairs, `external=internal`
        #[arg(long = "ip-pool", env = "UCOMPUTE_IP_POOL", value_delimiter = ',', value_parser = parse_pool_entry)]
        ip_pool: Vec<(String, String)>,
    },
}

/// Transport used to reach replicas
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TunnelMode {
    /// Through the API server's pod port-forward
    #[default]
    PortForward,
    /// Straight to the replica's cluster address
    Direct,
}

/// Arguments of the `tunnel` command
#[derive(clap::Args, Debug)]
pub struct TunnelArgs {
    /// Job identifier
    pub job_id: String,

    /// Replica ranks to open (repeatable)
    #[arg(long = "rank", default_value = "0")]
    pub ranks: Vec<u32>,

    /// Port on the replica to forward to
    #[arg(long, env = "UCOMPUTE_TARGET_PORT", default_value_t = 22)]
    pub target_port: u16,

    /// Transport used to reach the replica
    #[arg(long, env = "UCOMPUTE_TUNNEL_MODE", value_enum, default_value_t = TunnelMode::PortForward)]
    pub mode: TunnelMode,

    /// Public/internal subnet pairs, `external=internal`
    #[arg(long = "ip-pool", env = "UCOMPUTE_IP_POOL", value_delimiter = ',', value_parser = parse_pool_entry)]
    pub ip_pool: Vec<(String, String)>,

    /// Local interface the tunnel ports are bound on
    #[arg(long, env = "UCOMPUTE_BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind_address: IpAddr,

    /// Timeout for dialing a replica in direct mode, in milliseconds
    #[arg(long, env = "UCOMPUTE_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Seconds between liveness sweeps
    #[arg(long, env = "UCOMPUTE_REAP_INTERVAL_SECS", default_value_t = 30)]
    pub reap_interval_secs: u64,
}

impl TunnelArgs {
    /// Timeout for dialing a replica in direct mode
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Interval between liveness sweeps
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Parse `external=internal`
///
/// Only the shape is checked here; the pool validates the subnets.
pub fn parse_pool_entry(value: &str) -> Result<(String, String), String> {
    let (external, internal) = value
        .split_once('=')
        .ok_or_else(|| format!("expected external=internal, got '{value}'"))?;
    let (external, internal) = (external.trim(), internal.trim());
    if external.is_empty() || internal.is_empty() {
        return Err(format!("expected external=internal, got '{value}'"));
    }
    Ok((external.to_string(), internal.to_string()))
}
