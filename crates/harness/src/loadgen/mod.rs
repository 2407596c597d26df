//! # Load generator collaborator
//!
//! The harness never executes request load itself. For request-replay
//! scenarios it emits a declarative spec to an external generator, streams
//! the generator's per-request metric feed into the telemetry queue, and
//! consumes a final summary artifact when the generator exits.

use crate::{
    sandbox::{
        ContainerSpec,
        DockerSandbox,
        Mount,
        ResourceLimits,
        Sandbox,
        SandboxError,
    },
    telemetry::{
        MetricSample,
        SampleQueue,
    },
};
use async_trait::async_trait;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    io::BufRead,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tracing::{
    info,
    warn,
};

/// Container paths the generator contract fixes.
const SPEC_CONTAINER_PATH: &str = "/load/spec.json";
const PAYLOADS_CONTAINER_PATH: &str = "/load/payloads.jsonl";
const WORK_CONTAINER_DIR: &str = "/load/out";

/// Feed file the generator writes, one `MetricSample` JSON per line.
const RESULTS_FILE: &str = "load-results.jsonl";

/// Final summary file the generator writes.
const SUMMARY_FILE: &str = "load-summary.json";

#[derive(Debug, thiserror::Error)]
pub enum LoadGenError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed generator output at {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("load generator exited with code {code}")]
    Failed { code: i64 },

    #[error("load generator was never started")]
    NotStarted,
}

/// Declarative request-sequencing spec handed to the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSpec {
    pub scenario: String,
    pub engine_url: String,
    /// First payload (1-based) the generator replays.
    pub start_index: u64,
    /// Number of requests to issue.
    pub iterations: u64,
    /// Pause between requests in seconds; zero for closed-loop replay.
    pub delay_seconds: f64,
    /// Optional open-loop arrival rate per second. When set, the
    /// generator paces itself and `delay_seconds` is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u64>,
    /// Run fails when the request failure ratio exceeds this threshold.
    pub max_failure_rate: f64,
}

/// Final generator summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSummary {
    pub requests: u64,
    pub failed: u64,
    pub duration_seconds: f64,
}

/// Collaborator surface the orchestrator drives.
#[async_trait]
pub trait LoadGenerator: Send {
    async fn start(&mut self, spec: &LoadSpec) -> Result<(), LoadGenError>;

    /// Waits for the generator to finish, forwarding its streamed samples
    /// into the telemetry queue, and returns its final summary.
    async fn wait(&mut self) -> Result<LoadSummary, LoadGenError>;

    /// Force-stops a still-running generator.
    async fn stop(&mut self) -> Result<(), LoadGenError>;
}

/// Configuration for the container-hosted generator.
#[derive(Debug, Clone)]
pub struct ContainerLoadConfig {
    pub image: String,
    pub payloads_file: PathBuf,
    pub jwt_secret_file: PathBuf,
    /// Host directory the generator writes its feed and summary into.
    pub work_dir: PathBuf,
    pub network: Option<String>,
}

/// Load generator hosted in its own sandbox container.
pub struct ContainerLoadGenerator {
    cfg: ContainerLoadConfig,
    sandbox: DockerSandbox,
    queue: Arc<SampleQueue>,
    started: bool,
}

impl ContainerLoadGenerator {
    pub fn new(cfg: ContainerLoadConfig, sandbox: DockerSandbox, queue: Arc<SampleQueue>) -> Self {
        Self {
            cfg,
            sandbox,
            queue,
            started: false,
        }
    }

    fn forward_feed(&self) -> Result<(), LoadGenError> {
        let path = self.cfg.work_dir.join(RESULTS_FILE);
        if !path.is_file() {
            warn!(path = %path.display(), "load generator produced no feed file");
            return Ok(());
        }
        let file = std::fs::File::open(&path).map_err(|source| {
            LoadGenError::Io {
                path: path.clone(),
                source,
            }
        })?;
        let mut forwarded = 0u64;
        for line in std::io::BufReader::new(file).lines() {
            let line = line.map_err(|source| {
                LoadGenError::Io {
                    path: path.clone(),
                    source,
                }
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: MetricSample = serde_json::from_str(&line).map_err(|source| {
                LoadGenError::Malformed {
                    path: path.clone(),
                    source,
                }
            })?;
            self.queue.push(sample);
            forwarded += 1;
        }
        info!(forwarded, "forwarded load generator feed");
        Ok(())
    }
}

#[async_trait]
impl LoadGenerator for ContainerLoadGenerator {
    async fn start(&mut self, spec: &LoadSpec) -> Result<(), LoadGenError> {
        let spec_path = self.cfg.work_dir.join("load-spec.json");
        let json = serde_json::to_vec_pretty(spec).map_err(|source| {
            LoadGenError::Malformed {
                path: spec_path.clone(),
                source,
            }
        })?;
        std::fs::write(&spec_path, json).map_err(|source| {
            LoadGenError::Io {
                path: spec_path.clone(),
                source,
            }
        })?;

        let container_spec = ContainerSpec {
            image: self.cfg.image.clone(),
            name: format!("{}-load", spec.scenario),
            command: vec![
                "run".to_string(),
                format!("--spec={SPEC_CONTAINER_PATH}"),
                format!("--payloads={PAYLOADS_CONTAINER_PATH}"),
                format!("--out={WORK_CONTAINER_DIR}"),
            ],
            env: vec![],
            mounts: vec![
                Mount::read_only(&spec_path, SPEC_CONTAINER_PATH),
                Mount::read_only(&self.cfg.payloads_file, PAYLOADS_CONTAINER_PATH),
                Mount::read_only(&self.cfg.jwt_secret_file, "/load/jwtsecret.hex"),
                Mount::read_write(&self.cfg.work_dir, WORK_CONTAINER_DIR),
            ],
            published_ports: vec![],
            network: self.cfg.network.clone(),
            limits: ResourceLimits::default(),
            pull: false,
        };
        self.sandbox.start(container_spec).await?;
        self.started = true;
        info!(scenario = %spec.scenario, iterations = spec.iterations, "load generator started");
        Ok(())
    }

    async fn wait(&mut self) -> Result<LoadSummary, LoadGenError> {
        if !self.started {
            return Err(LoadGenError::NotStarted);
        }
        let mut exit = self.sandbox.exit_watcher();
        let code = loop {
            if let Some(code) = *exit.borrow() {
                break code;
            }
            if exit.changed().await.is_err() {
                break -1;
            }
        };

        self.forward_feed()?;
        if code != 0 {
            return Err(LoadGenError::Failed { code });
        }

        let path = self.cfg.work_dir.join(SUMMARY_FILE);
        let raw = std::fs::read(&path).map_err(|source| {
            LoadGenError::Io {
                path: path.clone(),
                source,
            }
        })?;
        serde_json::from_slice(&raw).map_err(|source| LoadGenError::Malformed { path, source })
    }

    async fn stop(&mut self) -> Result<(), LoadGenError> {
        if self.started {
            self.sandbox.stop(Duration::from_secs(5)).await?;
            self.started = false;
        }
        Ok(())
    }
}
