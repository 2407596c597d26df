//! # Sandbox
//!
//! Isolated, resource-constrained processes: the client under test, the
//! disposable re-execution oracle, and the load generator all run inside
//! one. The orchestrator only speaks this trait; the bollard-backed
//! implementation lives in [`docker`], and tests inject fakes.

pub mod docker;

use async_trait::async_trait;
use std::{
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use tokio::sync::watch;

pub use docker::{
    DockerNetwork,
    DockerSandbox,
};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("sandbox {name} is not running")]
    NotRunning { name: String },

    #[error("image {image} unavailable after {attempts} attempts")]
    ImageUnavailable { image: String, attempts: u32 },

    #[error("io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Bind mount into the sandbox. Snapshot mounts are declared read-only;
/// clients get a writable overlay on top prepared by the caller.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// CPU/memory/bandwidth constraints for one sandbox.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub cpus: Option<f64>,
    pub memory_bytes: Option<i64>,
    /// Ingress cap, e.g. "50mbit". Best-effort.
    pub download_rate: Option<String>,
    /// Egress cap, e.g. "15mbit". Best-effort.
    pub upload_rate: Option<String>,
}

/// Declarative start request: image, limits, mounts, environment.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Ports published 1:1 onto the host.
    pub published_ports: Vec<u16>,
    pub network: Option<String>,
    pub limits: ResourceLimits,
    /// Pull the image before starting.
    pub pull: bool,
}

/// Point-in-time resource usage of a sandboxed process.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Exit code of a finished sandbox process.
pub type ExitStatus = i64;

/// What the orchestrator needs from a sandbox runtime: start a process,
/// observe its exit at any time, sample its resources, capture its logs,
/// and stop it with a grace period before force.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn start(&mut self, spec: ContainerSpec) -> Result<(), SandboxError>;

    /// Observes process exit: the value flips to `Some(code)` the moment
    /// the process terminates, expectedly or not.
    fn exit_watcher(&self) -> watch::Receiver<Option<ExitStatus>>;

    async fn resource_sample(&self) -> Result<Option<ResourceSample>, SandboxError>;

    /// Streams the full container log into `dest`.
    async fn capture_logs(&self, dest: &Path) -> Result<(), SandboxError>;

    /// Graceful stop within `grace`, then forced termination and removal.
    async fn stop(&mut self, grace: Duration) -> Result<(), SandboxError>;
}
