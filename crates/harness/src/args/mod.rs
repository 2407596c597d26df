//! Command arguments for the `enginebench` binary.
//!
//! Each subcommand is a thin front end onto one pipeline component; the
//! args structs stay declarative and convert into the run-scoped config
//! values the components take.

use crate::{
    retry::BackoffPolicy,
    source::SourceConfig,
};
use clap::{
    Args,
    Parser,
    Subcommand,
};
use std::{
    path::PathBuf,
    time::Duration,
};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "enginebench",
    about = "Benchmarking harness for Ethereum execution clients"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a historical block range into a payload record stream
    Generate(GenerateArgs),
    /// Compress a record stream into fewer, denser payloads
    Compress(CompressArgs),
    /// Execute one benchmark scenario against a sandboxed client
    Run(RunArgs),
    /// Execute scenarios for several clients sequentially
    RunMany(RunManyArgs),
    /// Submit a record stream directly to an engine endpoint
    Send(SendArgs),
}

#[derive(Debug, Clone, Args)]
pub struct GenerateArgs {
    /// Chain RPC URL used for block retrieval
    #[arg(long = "rpc-url", env = "ENGINEBENCH_RPC_URL")]
    pub rpc_url: Url,

    /// Network label, used for logging and artifact naming
    #[arg(long, default_value = "mainnet", env = "ENGINEBENCH_NETWORK")]
    pub network: String,

    /// First block of the range, inclusive
    #[arg(long = "start-block")]
    pub start_block: u64,

    /// Last block of the range, inclusive
    #[arg(long = "end-block")]
    pub end_block: u64,

    /// Contiguous blocks per fetch shard
    #[arg(long = "shard-size", default_value = "32")]
    pub shard_size: u64,

    /// Shards fetched concurrently
    #[arg(long = "shard-concurrency", default_value = "4")]
    pub shard_concurrency: usize,

    /// Per-block requests in flight inside one shard
    #[arg(long = "workers-per-shard", default_value = "8")]
    pub workers_per_shard: usize,

    /// Retry attempts per block request
    #[arg(long = "rpc-retries", default_value = "5")]
    pub rpc_retries: u32,

    /// Output record stream path
    #[arg(long, default_value = "payloads/records.jsonl")]
    pub output: PathBuf,
}

impl GenerateArgs {
    pub fn source_config(&self) -> SourceConfig {
        let mut cfg = SourceConfig::new(
            self.rpc_url.clone(),
            self.network.clone(),
            self.start_block,
            self.end_block,
        );
        cfg.shard_size = self.shard_size;
        cfg.shard_concurrency = self.shard_concurrency;
        cfg.workers_per_shard = self.workers_per_shard;
        cfg.retry = BackoffPolicy::new(
            self.rpc_retries,
            Duration::from_millis(500),
            Duration::from_secs(10),
        );
        cfg
    }
}

/// Shared sandbox resource knobs.
#[derive(Debug, Clone, Args)]
pub struct SandboxArgs {
    /// CPU budget for the sandboxed client
    #[arg(long = "sandbox.cpus", default_value = "4.0")]
    pub cpus: f64,

    /// Memory limit in bytes, 32g default
    #[arg(long = "sandbox.mem-limit-bytes", default_value = "34359738368")]
    pub mem_limit_bytes: i64,

    /// Ingress bandwidth cap, e.g. "50mbit"
    #[arg(long = "sandbox.download-rate")]
    pub download_rate: Option<String>,

    /// Egress bandwidth cap, e.g. "15mbit"
    #[arg(long = "sandbox.upload-rate")]
    pub upload_rate: Option<String>,

    /// Pull images before starting containers
    #[arg(long = "sandbox.pull-images")]
    pub pull_images: bool,
}

#[derive(Debug, Clone, Args)]
pub struct CompressArgs {
    /// Input record stream
    #[arg(long)]
    pub input: PathBuf,

    /// Output directory for the compressed stream and its drop ledger
    #[arg(long = "output-dir")]
    pub output_dir: PathBuf,

    /// Consecutive payloads merged per window
    #[arg(long = "compression-factor", default_value = "2")]
    pub compression_factor: usize,

    /// Gas ceiling per synthesized payload, 4 gigagas default
    #[arg(long = "gas-ceiling", default_value = "4000000000")]
    pub gas_ceiling: u64,

    /// Keep blob-carrying transactions in the compressed stream
    #[arg(long = "include-blobs")]
    pub include_blobs: bool,

    /// Upper bound on empty gas-limit ramp blocks
    #[arg(long = "max-ramp-blocks", default_value = "20000")]
    pub max_ramp_blocks: u64,

    /// Image of the patched re-execution oracle client
    #[arg(long = "oracle-image", env = "ENGINEBENCH_ORACLE_IMAGE")]
    pub oracle_image: String,

    /// Writable, snapshot-seeded data directory for the oracle
    #[arg(long = "oracle-data-dir")]
    pub oracle_data_dir: PathBuf,

    /// Command passed to the oracle container; empty for the image default
    #[arg(long = "oracle-command", num_args = 0.., value_delimiter = ' ')]
    pub oracle_command: Vec<String>,

    /// Engine port the oracle publishes on the host
    #[arg(long = "oracle-engine-port", default_value = "8551")]
    pub oracle_engine_port: u16,

    /// Readiness deadline for the oracle in seconds
    #[arg(long = "oracle-readiness-deadline-secs", default_value = "120")]
    pub readiness_deadline_secs: u64,

    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

/// Shared scenario composition knobs.
#[derive(Debug, Clone, Args)]
pub struct ScenarioArgs {
    /// Record stream to replay
    #[arg(long)]
    pub payloads: PathBuf,

    /// Writable, snapshot-seeded client data directory on the host
    #[arg(long = "data-dir")]
    pub data_dir: PathBuf,

    /// Optional read-only snapshot mount
    #[arg(long = "snapshot-dir")]
    pub snapshot_dir: Option<PathBuf>,

    /// Where run artifacts land; one subdirectory per run
    #[arg(long = "outputs-dir", default_value = "outputs")]
    pub outputs_dir: PathBuf,

    /// Command passed to the client container; empty for the image default
    #[arg(long = "client-command", num_args = 0.., value_delimiter = ' ')]
    pub client_command: Vec<String>,

    /// Client data directory inside the container
    #[arg(long = "container-data-dir", default_value = "/data")]
    pub container_data_dir: String,

    /// Read-only snapshot path inside the container
    #[arg(long = "container-snapshot-dir", default_value = "/snapshot")]
    pub container_snapshot_dir: String,

    /// JWT secret path inside the container
    #[arg(long = "container-jwt-path", default_value = "/jwt/jwtsecret.hex")]
    pub container_jwt_path: String,

    /// Engine API port published on the host
    #[arg(long = "engine-port", default_value = "8551")]
    pub engine_port: u16,

    /// JSON-RPC port published on the host
    #[arg(long = "rpc-port", default_value = "8545")]
    pub rpc_port: u16,

    /// Readiness deadline in seconds
    #[arg(long = "readiness-deadline-secs", default_value = "120")]
    pub readiness_deadline_secs: u64,

    /// Grace period for telemetry drain and log capture in seconds
    #[arg(long = "drain-grace-secs", default_value = "30")]
    pub drain_grace_secs: u64,

    /// Grace period before a container stop turns into a kill, seconds
    #[arg(long = "stop-grace-secs", default_value = "10")]
    pub stop_grace_secs: u64,

    /// Capacity of the bounded telemetry queue
    #[arg(long = "telemetry.queue-capacity", default_value = "4096")]
    pub queue_capacity: usize,

    /// Process resource sampling interval in seconds
    #[arg(long = "telemetry.resource-interval-secs", default_value = "5")]
    pub resource_interval_secs: u64,

    /// Remote metrics push endpoint
    #[arg(long = "telemetry.remote-url", env = "ENGINEBENCH_REMOTE_SINK_URL")]
    pub remote_url: Option<Url>,

    /// Basic auth user for the remote sink
    #[arg(long = "telemetry.remote-user", env = "ENGINEBENCH_REMOTE_SINK_USER")]
    pub remote_user: Option<String>,

    /// Basic auth password for the remote sink
    #[arg(
        long = "telemetry.remote-password",
        env = "ENGINEBENCH_REMOTE_SINK_PASSWORD"
    )]
    pub remote_password: Option<String>,

    /// Hard deadline for a payload stuck SYNCING, seconds
    #[arg(long = "driver.syncing-deadline-secs", default_value = "300")]
    pub syncing_deadline_secs: u64,

    /// Pacing delay between payloads in milliseconds
    #[arg(long = "driver.payload-delay-ms")]
    pub payload_delay_ms: Option<u64>,

    /// Load generator image; enables request-replay load when set
    #[arg(long = "load.image")]
    pub load_image: Option<String>,

    /// Requests the load generator issues
    #[arg(long = "load.iterations", default_value = "0")]
    pub load_iterations: u64,

    /// First payload (1-based) the load generator replays
    #[arg(long = "load.start", default_value = "1")]
    pub load_start: u64,

    /// Pause between load requests in seconds
    #[arg(long = "load.delay-seconds", default_value = "0.0")]
    pub load_delay_seconds: f64,

    /// Open-loop arrival rate per second
    #[arg(long = "load.rate")]
    pub load_rate: Option<u64>,

    /// Failure-rate threshold the load run must stay under
    #[arg(long = "load.max-failure-rate", default_value = "0.01")]
    pub load_max_failure_rate: f64,

    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

/// `label=image` pair naming one client under test.
#[derive(Debug, Clone)]
pub struct ClientArg {
    pub label: String,
    pub image: String,
}

pub fn parse_client(value: &str) -> Result<ClientArg, String> {
    let (label, image) = value
        .split_once('=')
        .ok_or_else(|| format!("expected label=image, got {value}"))?;
    if label.is_empty() || image.is_empty() {
        return Err(format!("expected label=image, got {value}"));
    }
    Ok(ClientArg {
        label: label.to_string(),
        image: image.to_string(),
    })
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Scenario name; defaults to the client label
    #[arg(long)]
    pub name: Option<String>,

    /// Client under test as label=image
    #[arg(long, value_parser = parse_client)]
    pub client: ClientArg,

    #[command(flatten)]
    pub scenario: ScenarioArgs,
}

#[derive(Debug, Clone, Args)]
pub struct RunManyArgs {
    /// Clients under test, label=image, one scenario each
    #[arg(long = "client", required = true, value_parser = parse_client)]
    pub clients: Vec<ClientArg>,

    /// Abort the queue on the first failed scenario
    #[arg(long = "stop-on-failure")]
    pub stop_on_failure: bool,

    #[command(flatten)]
    pub scenario: ScenarioArgs,
}

#[derive(Debug, Clone, Args)]
pub struct SendArgs {
    /// Engine endpoint to submit against
    #[arg(long = "engine-url", env = "ENGINEBENCH_ENGINE_URL")]
    pub engine_url: Url,

    /// Shared JWT secret file, hex
    #[arg(long = "jwt-secret-file")]
    pub jwt_secret_file: PathBuf,

    /// Record stream to replay
    #[arg(long)]
    pub payloads: PathBuf,

    /// Hard deadline for a payload stuck SYNCING, seconds
    #[arg(long = "syncing-deadline-secs", default_value = "300")]
    pub syncing_deadline_secs: u64,

    /// Pacing delay between payloads in milliseconds
    #[arg(long = "payload-delay-ms")]
    pub payload_delay_ms: Option<u64>,

    /// Optional directory for latency csv artifacts
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_client_requires_label_and_image() {
        let client = parse_client("reth=ghcr.io/paradigmxyz/reth:latest").unwrap();
        assert_eq!(client.label, "reth");
        assert_eq!(client.image, "ghcr.io/paradigmxyz/reth:latest");

        assert!(parse_client("reth").is_err());
        assert!(parse_client("=image").is_err());
        assert!(parse_client("reth=").is_err());
    }

    #[test]
    fn generate_args_build_a_source_config() {
        let cli = Cli::parse_from([
            "enginebench",
            "generate",
            "--rpc-url",
            "http://localhost:8545",
            "--start-block",
            "100",
            "--end-block",
            "200",
        ]);
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let cfg = args.source_config();
        assert_eq!(cfg.start_block, 100);
        assert_eq!(cfg.end_block, 200);
        assert_eq!(cfg.shard_size, 32);
    }

    #[test]
    fn run_many_accepts_multiple_clients() {
        let cli = Cli::parse_from([
            "enginebench",
            "run-many",
            "--client",
            "reth=r:1",
            "--client",
            "geth=g:1",
            "--stop-on-failure",
            "--payloads",
            "records.jsonl",
            "--data-dir",
            "/tmp/data",
        ]);
        let Command::RunMany(args) = cli.command else {
            panic!("expected run-many");
        };
        assert_eq!(args.clients.len(), 2);
        assert!(args.stop_on_failure);
    }
}
