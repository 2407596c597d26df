//! Bollard-backed sandbox runtime.

use super::{
    ContainerSpec,
    ExitStatus,
    Mount,
    ResourceSample,
    Sandbox,
    SandboxError,
};
use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config,
        CreateContainerOptions,
        LogOutput,
        LogsOptions,
        RemoveContainerOptions,
        StartContainerOptions,
        StatsOptions,
        StopContainerOptions,
        WaitContainerOptions,
    },
    exec::{
        CreateExecOptions,
        StartExecOptions,
    },
    image::{
        CreateImageOptions,
        ListImagesOptions,
    },
    network::CreateNetworkOptions,
    service::{
        HostConfig,
        PortBinding,
    },
};
use futures::{
    StreamExt,
    TryStreamExt,
};
use std::{
    collections::HashMap,
    io::Write,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{
    debug,
    info,
    warn,
};

/// Attempts to make an image available before giving up.
const IMAGE_PULL_ATTEMPTS: u32 = 3;

/// Initial delay of the image-pull backoff.
const IMAGE_PULL_DELAY: Duration = Duration::from_secs(1);

/// Isolated bridge network for one scenario's containers.
#[derive(Debug)]
pub struct DockerNetwork {
    docker: Arc<Docker>,
    name: String,
}

impl DockerNetwork {
    pub async fn create(docker: Arc<Docker>, name: impl Into<String>) -> Result<Self, SandboxError> {
        let name = name.into();
        docker
            .create_network(CreateNetworkOptions {
                name: name.clone(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await?;
        debug!(network = %name, "created container network");
        Ok(Self { docker, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn remove(self) -> Result<(), SandboxError> {
        self.docker.remove_network(&self.name).await?;
        debug!(network = %self.name, "removed container network");
        Ok(())
    }
}

/// One container-hosted process with resource limits and exit
/// supervision.
pub struct DockerSandbox {
    docker: Arc<Docker>,
    name: String,
    container_id: Option<String>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
}

impl DockerSandbox {
    pub fn new(docker: Arc<Docker>, name: impl Into<String>) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            docker,
            name: name.into(),
            container_id: None,
            exit_tx,
            exit_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn container_id(&self) -> Result<&str, SandboxError> {
        self.container_id.as_deref().ok_or_else(|| {
            SandboxError::NotRunning {
                name: self.name.clone(),
            }
        })
    }

    /// Ensures the image exists locally, pulling with backoff if not.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        let images = self
            .docker
            .list_images(None::<ListImagesOptions<String>>)
            .await?;
        if images
            .iter()
            .any(|img| img.repo_tags.contains(&image.to_string()))
        {
            debug!(image, "image exists locally");
            return Ok(());
        }

        let mut delay = IMAGE_PULL_DELAY;
        for attempt in 1..=IMAGE_PULL_ATTEMPTS {
            info!(image, attempt, "pulling image");
            let result = self
                .docker
                .create_image(
                    Some(CreateImageOptions {
                        from_image: image.to_string(),
                        ..Default::default()
                    }),
                    None,
                    None,
                )
                .try_collect::<Vec<_>>()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(error) if attempt < IMAGE_PULL_ATTEMPTS => {
                    warn!(image, %error, attempt, "image pull failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => {
                    warn!(image, %error, "image pull failed");
                    return Err(SandboxError::ImageUnavailable {
                        image: image.to_string(),
                        attempts: IMAGE_PULL_ATTEMPTS,
                    });
                }
            }
        }
        Ok(())
    }

    /// Applies ingress/egress caps inside the container. Best-effort: the
    /// image must ship `tc`, and some runtimes refuse NET_ADMIN; a failure
    /// is logged, never fatal.
    pub async fn limit_bandwidth(
        &self,
        download_rate: Option<&str>,
        upload_rate: Option<&str>,
    ) -> Result<(), SandboxError> {
        let id = self.container_id()?.to_string();
        let mut commands: Vec<Vec<String>> = Vec::new();
        if let Some(rate) = upload_rate {
            commands.push(
                ["tc", "qdisc", "add", "dev", "eth0", "root", "tbf", "rate", rate, "burst", "32kbit", "latency", "400ms"]
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            );
        }
        if let Some(rate) = download_rate {
            commands.push(
                ["tc", "qdisc", "add", "dev", "eth0", "handle", "ffff:", "ingress"]
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            );
            commands.push(
                [
                    "tc", "filter", "add", "dev", "eth0", "parent", "ffff:", "matchall", "police",
                    "rate", rate, "burst", "256kbit", "drop",
                ]
                .iter()
                .map(ToString::to_string)
                .collect(),
            );
        }
        for cmd in commands {
            let exec = self
                .docker
                .create_exec(
                    &id,
                    CreateExecOptions {
                        cmd: Some(cmd.clone()),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            if let Err(error) = self
                .docker
                .start_exec(&exec.id, None::<StartExecOptions>)
                .await
            {
                warn!(container = %self.name, ?cmd, %error, "bandwidth limit command failed");
            }
        }
        Ok(())
    }
}

fn bind_strings(mounts: &[Mount]) -> Vec<String> {
    mounts
        .iter()
        .map(|m| {
            let mode = if m.read_only { "ro" } else { "rw" };
            format!("{}:{}:{}", m.host.display(), m.container, mode)
        })
        .collect()
}

fn port_bindings(ports: &[u16]) -> HashMap<String, Option<Vec<PortBinding>>> {
    ports
        .iter()
        .map(|port| {
            (
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            )
        })
        .collect()
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn start(&mut self, spec: ContainerSpec) -> Result<(), SandboxError> {
        if spec.pull {
            self.ensure_image(&spec.image).await?;
        }

        let host_config = HostConfig {
            binds: Some(bind_strings(&spec.mounts)),
            port_bindings: Some(port_bindings(&spec.published_ports)),
            nano_cpus: spec.limits.cpus.map(|cpus| (cpus * 1e9) as i64),
            memory: spec.limits.memory_bytes,
            network_mode: spec.network.clone(),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: self.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        info!(
            container = %self.name,
            image = %spec.image,
            cpus = ?spec.limits.cpus,
            memory = ?spec.limits.memory_bytes,
            "started sandboxed process"
        );

        // Exit supervision: the watcher flips the moment the process dies,
        // whatever the orchestrator happens to be doing.
        let docker = Arc::clone(&self.docker);
        let id = created.id.clone();
        let name = self.name.clone();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let mut wait = docker.wait_container(
                &id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            let code = match wait.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(error)) => {
                    warn!(container = %name, %error, "container wait stream failed");
                    -1
                }
                None => -1,
            };
            debug!(container = %name, code, "sandboxed process exited");
            let _ = exit_tx.send(Some(code));
        });

        if spec.limits.download_rate.is_some() || spec.limits.upload_rate.is_some() {
            self.container_id = Some(created.id.clone());
            self.limit_bandwidth(
                spec.limits.download_rate.as_deref(),
                spec.limits.upload_rate.as_deref(),
            )
            .await?;
        }
        self.container_id = Some(created.id);
        Ok(())
    }

    fn exit_watcher(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit_rx.clone()
    }

    async fn resource_sample(&self) -> Result<Option<ResourceSample>, SandboxError> {
        let id = self.container_id()?;
        let stats = self
            .docker
            .stats(
                id,
                Some(StatsOptions {
                    stream: false,
                    one_shot: false,
                }),
            )
            .next()
            .await;
        let Some(stats) = stats.transpose()? else {
            return Ok(None);
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);
        let cpu_percent = if system_delta > 0 {
            cpu_delta as f64 / system_delta as f64 * online_cpus as f64 * 100.0
        } else {
            0.0
        };
        Ok(Some(ResourceSample {
            cpu_percent,
            memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        }))
    }

    async fn capture_logs(&self, dest: &Path) -> Result<(), SandboxError> {
        let id = self.container_id()?;
        let io_err = |source| {
            SandboxError::Io {
                path: dest.to_path_buf(),
                source,
            }
        };
        let mut file =
            std::io::BufWriter::new(std::fs::File::create(dest).map_err(io_err)?);
        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(entry) = logs.next().await {
            match entry? {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    file.write_all(&message).map_err(io_err)?;
                }
                _ => {}
            }
        }
        file.flush().map_err(io_err)?;
        info!(container = %self.name, dest = %dest.display(), "captured container logs");
        Ok(())
    }

    async fn stop(&mut self, grace: Duration) -> Result<(), SandboxError> {
        let Some(id) = self.container_id.take() else {
            return Ok(());
        };
        let stop = self
            .docker
            .stop_container(
                &id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await;
        if let Err(error) = stop {
            warn!(container = %self.name, %error, "graceful stop failed, forcing removal");
        }
        self.docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        info!(container = %self.name, "sandboxed process stopped and removed");
        Ok(())
    }
}
