use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::reconciler::ops::OpsConfig;
use crate::reconciler::runner::RunnerConfig;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Reconcile the desired state file into the load-balancing maps
    Agent(AgentArgs),
    /// Print the contents of the load-balancing maps
    Dump(DumpArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Path to the bpf fs for bpf maps
    #[arg(long, env = "MESH_LB_BPF_FS", default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,

    /// Metrics listener for agent
    #[arg(long, env = "MESH_LB_METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Desired state of services, frontends and backends
    #[arg(
        long,
        env = "MESH_LB_STATE_FILE",
        default_value = "/etc/mesh-lb/services.yaml"
    )]
    pub state_file: PathBuf,

    /// How often the desired state file is re-read
    #[arg(long, env = "MESH_LB_STATE_REFRESH_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub state_refresh_interval: Duration,

    /// How often map entries without a desired frontend are removed
    #[arg(long, env = "MESH_LB_PRUNE_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub prune_interval: Duration,

    /// Delay before the first retry of a failed operation
    #[arg(long, env = "MESH_LB_RETRY_BACKOFF_MIN", default_value = "100ms", value_parser = parse_duration)]
    pub retry_backoff_min: Duration,

    /// Upper bound of the retry delay
    #[arg(long, env = "MESH_LB_RETRY_BACKOFF_MAX", default_value = "1m", value_parser = parse_duration)]
    pub retry_backoff_max: Duration,

    /// Maintain the session affinity match map
    #[arg(long, env = "MESH_LB_ENABLE_SESSION_AFFINITY", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_session_affinity: bool,

    /// Mark ClusterIP frontends as reachable from outside the cluster
    #[arg(long, env = "MESH_LB_EXTERNAL_CLUSTER_IP", default_value_t = false, action = clap::ArgAction::Set)]
    pub external_cluster_ip: bool,
}

impl AgentArgs {
    pub fn ops_config(&self) -> OpsConfig {
        OpsConfig {
            enable_session_affinity: self.enable_session_affinity,
            external_cluster_ip: self.external_cluster_ip,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            retry_backoff_min: self.retry_backoff_min,
            retry_backoff_max: self.retry_backoff_max.max(self.retry_backoff_min),
            prune_interval: self.prune_interval,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DumpArgs {
    /// Path to the bpf fs for bpf maps
    #[arg(long, env = "MESH_LB_BPF_FS", default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,
}

/// Parses durations such as `250ms`, `10s`, `5m` or `1h`. A bare number is
/// taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        _ => return Err(format!("invalid duration unit {unit:?} in {s:?}")),
    };
    if duration.is_zero() {
        return Err(format!("duration {s:?} must be greater than zero"));
    }
    Ok(duration)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_agent_defaults() {
        let cli = Cli::try_parse_from(["mesh-lb", "agent"]).unwrap();
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.bpf_fs, PathBuf::from("/sys/fs/bpf"));
        assert_eq!(args.metrics_address.port(), 9090);
        let runner = args.runner_config();
        assert_eq!(runner.prune_interval, Duration::from_secs(300));
        assert_eq!(runner.retry_backoff_min, Duration::from_millis(100));
        assert_eq!(runner.retry_backoff_max, Duration::from_secs(60));
        let ops = args.ops_config();
        assert!(ops.enable_session_affinity);
        assert!(!ops.external_cluster_ip);
    }

    #[test]
    fn test_agent_flags() {
        let cli = Cli::try_parse_from([
            "mesh-lb",
            "agent",
            "--state-file",
            "/tmp/lb.yaml",
            "--enable-session-affinity",
            "false",
            "--retry-backoff-min",
            "2s",
            "--retry-backoff-max",
            "1s",
        ])
        .unwrap();
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.state_file, PathBuf::from("/tmp/lb.yaml"));
        assert!(!args.ops_config().enable_session_affinity);
        assert_eq!(args.runner_config().retry_backoff_max, Duration::from_secs(2));
    }
}
