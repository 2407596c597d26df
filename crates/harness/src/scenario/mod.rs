//! # Scenario orchestrator
//!
//! One benchmark run is an explicit state machine:
//!
//! ```text
//! Pending → Provisioning → Warming → Driving → Draining → Summarizing → Done
//!                \            \         \          \           \
//!                 `------------`---------`----------`-----------`--→ Failed
//! ```
//!
//! Each state has one handler; handlers speak to their collaborators
//! through the [`Sandbox`], [`PayloadDriver`], and
//! [`crate::loadgen::LoadGenerator`] traits so every transition is unit
//! testable against fakes. No partial success is ever reported as
//! success: any unrecoverable error transitions straight to `Failed` with
//! diagnostics captured.

use crate::{
    driver::{
        self,
        DriveError,
        DriveOutcome,
        DriverConfig,
    },
    loadgen::{
        LoadGenError,
        LoadGenerator,
        LoadSpec,
        LoadSummary,
    },
    metrics::TelemetryMetrics,
    output::{
        self,
        OutputError,
    },
    retry::{
        BackoffPolicy,
        with_backoff,
    },
    sandbox::{
        ContainerSpec,
        Sandbox,
        SandboxError,
    },
    summary::{
        self,
        FailureInfo,
        RunSummary,
        SummaryError,
    },
    telemetry::{
        HttpPushSink,
        JsonlSink,
        MetricSample,
        MetricSink,
        SampleQueue,
        SinkError,
        run_fanout,
    },
};
use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use engine_client::{
    EngineClient,
    EngineClientConfig,
    JwtProvider,
    auth::DEFAULT_TOKEN_VALIDITY_SECS,
};
use payload_store::StoreReader;
use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{
    debug,
    error,
    info,
    warn,
};
use url::Url;

pub use crate::telemetry::ACCEPTED_SAMPLE;

/// Samples preserved in the failure diagnostics artifact.
const FAILURE_SAMPLE_TAIL: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Drive(#[from] DriveError),

    #[error(transparent)]
    Load(#[from] LoadGenError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Summary(#[from] SummaryError),

    #[error("io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("client process exited unexpectedly with code {code}")]
    ClientExited { code: i64 },

    #[error("client readiness failed: {message}")]
    Readiness { message: String },

    #[error("client readiness deadline of {0:?} elapsed")]
    ReadinessDeadline(Duration),
}

impl ScenarioError {
    fn payload_index(&self) -> Option<u64> {
        match self {
            Self::Drive(error) => error.payload_index(),
            _ => None,
        }
    }
}

/// Lifecycle states of one benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioState {
    Pending,
    Provisioning,
    Warming,
    Driving,
    Draining,
    Summarizing,
    Done,
    Failed,
}

impl ScenarioState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Warming => "warming",
            Self::Driving => "driving",
            Self::Draining => "draining",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Remote metrics push target.
#[derive(Debug, Clone)]
pub struct RemoteSinkConfig {
    pub endpoint: Url,
    pub basic_auth: Option<(String, String)>,
}

/// Run-scoped configuration for one scenario, composed by the command
/// layer and threaded in whole.
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub name: String,
    /// Short client label, used for artifact names and sample tags.
    pub client_label: String,
    pub client_spec: ContainerSpec,
    pub outputs_dir: PathBuf,
    pub readiness: BackoffPolicy,
    pub readiness_deadline: Duration,
    pub drain_grace: Duration,
    pub stop_grace: Duration,
    pub sample_queue_capacity: usize,
    pub sink_retry: BackoffPolicy,
    pub resource_sample_interval: Duration,
    pub remote_sink: Option<RemoteSinkConfig>,
    pub load: Option<LoadSpec>,
}

/// What one scenario run ended as.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub state: ScenarioState,
    pub outputs_dir: PathBuf,
    pub summary: Option<RunSummary>,
    pub failure: Option<FailureInfo>,
}

/// The driving collaborator: readiness probing plus the strict-order
/// submission loop. The production implementation wraps the engine
/// session; tests inject fakes.
#[async_trait]
pub trait PayloadDriver: Send {
    async fn wait_ready(
        &mut self,
        retry: BackoffPolicy,
        deadline: Duration,
    ) -> Result<(), ScenarioError>;

    async fn drive(&mut self, samples: Arc<SampleQueue>) -> Result<DriveOutcome, DriveError>;
}

/// Production driver: replays a record stream from disk over an
/// authenticated engine session.
pub struct EngineStreamDriver {
    engine_url: Url,
    jwt_secret_file: PathBuf,
    records_path: PathBuf,
    cfg: DriverConfig,
}

impl EngineStreamDriver {
    pub fn new(
        engine_url: Url,
        jwt_secret_file: PathBuf,
        records_path: PathBuf,
        cfg: DriverConfig,
    ) -> Self {
        Self {
            engine_url,
            jwt_secret_file,
            records_path,
            cfg,
        }
    }

    fn client(&self) -> Result<EngineClient, DriveError> {
        let auth = JwtProvider::from_file(&self.jwt_secret_file, DEFAULT_TOKEN_VALIDITY_SECS)
            .map_err(engine_client::EngineApiError::from)?;
        Ok(EngineClient::new(
            EngineClientConfig::new(self.engine_url.clone()),
            auth,
        )?)
    }
}

#[async_trait]
impl PayloadDriver for EngineStreamDriver {
    async fn wait_ready(
        &mut self,
        retry: BackoffPolicy,
        deadline: Duration,
    ) -> Result<(), ScenarioError> {
        let client = self.client().map_err(ScenarioError::Drive)?;
        let poll = with_backoff(retry, "readiness poll", || async {
            client.block_number().await
        });
        match tokio::time::timeout(deadline, poll).await {
            Ok(Ok(number)) => {
                info!(latest_block = number, "client json-rpc is available");
                Ok(())
            }
            Ok(Err(error)) => {
                Err(ScenarioError::Readiness {
                    message: error.to_string(),
                })
            }
            Err(_) => Err(ScenarioError::ReadinessDeadline(deadline)),
        }
    }

    async fn drive(&mut self, samples: Arc<SampleQueue>) -> Result<DriveOutcome, DriveError> {
        let client = self.client()?;
        let reader = StoreReader::open(&self.records_path)?;
        driver::drive(&client, reader, &self.cfg, Some(&samples)).await
    }
}

/// Waits out the fan-out consumer up to `grace`. Returns the delivered
/// count if it drained in time; aborts it otherwise.
async fn drain_fanout(handle: &mut JoinHandle<u64>, grace: Duration) -> Option<u64> {
    match tokio::time::timeout(grace, &mut *handle).await {
        Ok(Ok(delivered)) => Some(delivered),
        Ok(Err(error)) => {
            warn!(%error, "telemetry fan-out task failed");
            None
        }
        Err(_) => {
            warn!(?grace, "telemetry drain grace elapsed, aborting fan-out");
            handle.abort();
            None
        }
    }
}

/// Drives one scenario through its lifecycle. Owns the run state
/// exclusively; collaborators are injected.
pub struct ScenarioRunner<S, D, L> {
    cfg: ScenarioConfig,
    client: S,
    driver: D,
    load: Option<L>,
    queue: Arc<SampleQueue>,
    samples_path: PathBuf,
    state: ScenarioState,
    started_at: DateTime<Utc>,
    fanout: Option<JoinHandle<u64>>,
    drive_outcome: Option<DriveOutcome>,
    load_summary: Option<LoadSummary>,
    pending_failure: Option<(ScenarioState, ScenarioError)>,
    summary: Option<RunSummary>,
}

impl<S, D, L> ScenarioRunner<S, D, L>
where
    S: Sandbox,
    D: PayloadDriver,
    L: LoadGenerator,
{
    pub fn new(cfg: ScenarioConfig, client: S, driver: D, load: Option<L>) -> Self {
        let queue = SampleQueue::new(cfg.sample_queue_capacity);
        let samples_path = cfg.outputs_dir.join("samples.jsonl");
        Self {
            cfg,
            client,
            driver,
            load,
            queue,
            samples_path,
            state: ScenarioState::Pending,
            started_at: Utc::now(),
            fanout: None,
            drive_outcome: None,
            load_summary: None,
            pending_failure: None,
            summary: None,
        }
    }

    /// Queue handle for collaborators constructed by the command layer.
    pub fn sample_queue(&self) -> Arc<SampleQueue> {
        Arc::clone(&self.queue)
    }

    /// Attaches a load generator after construction; the command layer
    /// needs the sample queue handle to build one.
    pub fn set_load(&mut self, load: L) {
        self.load = Some(load);
    }

    /// Runs the state machine to a terminal state.
    pub async fn run(mut self) -> ScenarioOutcome {
        info!(scenario = %self.cfg.name, client = %self.cfg.client_label, "starting scenario");
        while !self.state.is_terminal() {
            let current = self.state;
            self.state = match self.step(current).await {
                Ok(next) => next,
                Err(err) => {
                    error!(stage = %current, %err, "scenario stage failed");
                    self.pending_failure = Some((current, err));
                    ScenarioState::Failed
                }
            };
            debug!(from = %current, to = %self.state, "scenario transition");
        }

        let failure = if self.state == ScenarioState::Failed {
            self.finalize_failure().await
        } else {
            None
        };

        info!(scenario = %self.cfg.name, state = %self.state, "scenario finished");
        ScenarioOutcome {
            name: self.cfg.name,
            state: self.state,
            outputs_dir: self.cfg.outputs_dir,
            summary: self.summary,
            failure,
        }
    }

    async fn step(&mut self, state: ScenarioState) -> Result<ScenarioState, ScenarioError> {
        match state {
            ScenarioState::Pending => Ok(ScenarioState::Provisioning),
            ScenarioState::Provisioning => self.provision().await,
            ScenarioState::Warming => self.warm().await,
            ScenarioState::Driving => self.drive_stage().await,
            ScenarioState::Draining => self.drain().await,
            ScenarioState::Summarizing => self.summarize().await,
            ScenarioState::Done | ScenarioState::Failed => unreachable!("terminal state"),
        }
    }

    async fn provision(&mut self) -> Result<ScenarioState, ScenarioError> {
        std::fs::create_dir_all(&self.cfg.outputs_dir).map_err(|source| {
            ScenarioError::Io {
                path: self.cfg.outputs_dir.clone(),
                source,
            }
        })?;

        let mut sinks: Vec<Box<dyn MetricSink>> =
            vec![Box::new(JsonlSink::create(&self.samples_path)?)];
        if let Some(remote) = &self.cfg.remote_sink {
            sinks.push(Box::new(HttpPushSink::new(
                remote.endpoint.clone(),
                remote.basic_auth.clone(),
            )));
        }
        self.fanout = Some(tokio::spawn(run_fanout(
            Arc::clone(&self.queue),
            sinks,
            self.cfg.sink_retry,
        )));

        self.client.start(self.cfg.client_spec.clone()).await?;
        Ok(ScenarioState::Warming)
    }

    async fn warm(&mut self) -> Result<ScenarioState, ScenarioError> {
        let mut exit_rx = self.client.exit_watcher();
        if let Some(code) = *exit_rx.borrow() {
            return Err(ScenarioError::ClientExited { code });
        }
        tokio::select! {
            ready = self.driver.wait_ready(self.cfg.readiness, self.cfg.readiness_deadline) => {
                ready?;
                Ok(ScenarioState::Driving)
            }
            _ = exit_rx.changed() => {
                Err(ScenarioError::ClientExited { code: (*exit_rx.borrow()).unwrap_or(-1) })
            }
        }
    }

    async fn drive_stage(&mut self) -> Result<ScenarioState, ScenarioError> {
        let queue = Arc::clone(&self.queue);
        let mut exit_rx = self.client.exit_watcher();
        if let Some(code) = *exit_rx.borrow() {
            return Err(ScenarioError::ClientExited { code });
        }

        if let (Some(load), Some(spec)) = (self.load.as_mut(), self.cfg.load.as_ref()) {
            load.start(spec).await?;
        }

        let mut interval = tokio::time::interval(self.cfg.resource_sample_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let drive = self.driver.drive(Arc::clone(&queue));
        tokio::pin!(drive);

        // The load generator is supervised alongside the driver: its
        // unexpected failure mid-drive fails the run immediately.
        let load = self.load.as_mut();
        let load_wait = async move {
            match load {
                Some(load) => Some(load.wait().await),
                None => None,
            }
        };
        tokio::pin!(load_wait);
        let mut load_finished = false;

        let outcome = loop {
            tokio::select! {
                outcome = &mut drive => break outcome?,
                result = &mut load_wait, if !load_finished => {
                    load_finished = true;
                    if let Some(result) = result {
                        self.load_summary = Some(result?);
                    }
                }
                _ = exit_rx.changed() => {
                    return Err(ScenarioError::ClientExited {
                        code: (*exit_rx.borrow()).unwrap_or(-1),
                    });
                }
                _ = interval.tick() => {
                    if let Ok(Some(sample)) = self.client.resource_sample().await {
                        queue.push(MetricSample::new("client_cpu_percent", sample.cpu_percent));
                        queue.push(MetricSample::new(
                            "client_memory_bytes",
                            sample.memory_bytes as f64,
                        ));
                    }
                }
            }
        };
        self.drive_outcome = Some(outcome);

        if !load_finished {
            tokio::select! {
                result = &mut load_wait => {
                    if let Some(result) = result {
                        self.load_summary = Some(result?);
                    }
                }
                _ = exit_rx.changed() => {
                    return Err(ScenarioError::ClientExited {
                        code: (*exit_rx.borrow()).unwrap_or(-1),
                    });
                }
            }
        }
        Ok(ScenarioState::Draining)
    }

    async fn drain(&mut self) -> Result<ScenarioState, ScenarioError> {
        // Stop accepting new samples and wait for the in-flight flush up
        // to the grace deadline.
        self.queue.close();
        if let Some(mut handle) = self.fanout.take() {
            if let Some(delivered) = drain_fanout(&mut handle, self.cfg.drain_grace).await {
                TelemetryMetrics {
                    samples_delivered: delivered,
                    samples_dropped: self.queue.dropped(),
                }
                .commit();
            }
        }

        if let Some(load) = self.load.as_mut()
            && let Err(err) = load.stop().await
        {
            warn!(%err, "load generator stop failed");
        }

        let log_path = self
            .cfg
            .outputs_dir
            .join(format!("{}.log", self.cfg.client_label));
        if let Err(err) = self.client.capture_logs(&log_path).await {
            warn!(%err, "client log capture failed");
        }
        self.client.stop(self.cfg.stop_grace).await?;
        Ok(ScenarioState::Summarizing)
    }

    async fn summarize(&mut self) -> Result<ScenarioState, ScenarioError> {
        let metrics = summary::summarize_samples(&self.samples_path)?;
        let outcome = self.drive_outcome.take().unwrap_or_default();

        output::write_benchmark_results(&self.cfg.outputs_dir, &outcome.gas_rows, &outcome.combined)?;

        let total = outcome.total_gas();
        let run_summary = RunSummary {
            scenario: self.cfg.name.clone(),
            client: self.cfg.client_label.clone(),
            succeeded: true,
            started_at: self.started_at,
            finished_at: Utc::now(),
            payloads_processed: outcome.combined.len() as u64,
            total_gas_used: total.as_ref().map(|t| t.total_gas_used).unwrap_or_default(),
            gigagas_per_second: total.as_ref().map(output::TotalGasOutput::total_gigagas_per_second),
            samples_dropped: self.queue.dropped(),
            metrics,
            load: self.load_summary.take(),
            failure: None,
        };
        summary::write_summary(&self.cfg.outputs_dir.join("summary.json"), &run_summary)?;
        self.summary = Some(run_summary);
        Ok(ScenarioState::Done)
    }

    /// Terminal cleanup for a failed run: flush what telemetry we can,
    /// capture logs, reap processes, and persist diagnostics. Every step
    /// is best-effort — a failed run must still terminate.
    async fn finalize_failure(&mut self) -> Option<FailureInfo> {
        self.queue.close();
        if let Some(mut handle) = self.fanout.take() {
            drain_fanout(&mut handle, self.cfg.drain_grace).await;
        }

        if let Some(load) = self.load.as_mut()
            && let Err(err) = load.stop().await
        {
            warn!(%err, "load generator stop failed during failure cleanup");
        }
        let log_path = self
            .cfg
            .outputs_dir
            .join(format!("{}.log", self.cfg.client_label));
        if let Err(err) = self.client.capture_logs(&log_path).await {
            warn!(%err, "client log capture failed during failure cleanup");
        }
        if let Err(err) = self.client.stop(self.cfg.stop_grace).await {
            warn!(%err, "client stop failed during failure cleanup");
        }

        let (stage, error) = match self.pending_failure.take() {
            Some((stage, error)) => (stage.to_string(), Some(error)),
            None => (String::new(), None),
        };

        // Diagnostics: the tail of the sample log plus the last payload
        // the client accepted before things went wrong.
        let tail = summary::tail_samples(&self.samples_path, FAILURE_SAMPLE_TAIL)
            .unwrap_or_default();
        let last_accepted = tail
            .iter()
            .filter(|s| s.name == ACCEPTED_SAMPLE)
            .max_by_key(|s| s.payload_index)
            .and_then(|s| s.tags.get("block_hash").cloned());
        if !tail.is_empty() {
            let tail_path = self.cfg.outputs_dir.join("failure-samples.jsonl");
            let lines: String = tail
                .iter()
                .filter_map(|s| serde_json::to_string(s).ok())
                .map(|l| l + "\n")
                .collect();
            if let Err(err) = std::fs::write(&tail_path, lines) {
                warn!(%err, "failed to persist failure sample tail");
            }
        }

        let failure = FailureInfo {
            stage,
            payload_index: error.as_ref().and_then(ScenarioError::payload_index),
            message: error.map(|e| e.to_string()).unwrap_or_default(),
            last_accepted_payload: last_accepted,
        };

        let run_summary = RunSummary {
            scenario: self.cfg.name.clone(),
            client: self.cfg.client_label.clone(),
            succeeded: false,
            started_at: self.started_at,
            finished_at: Utc::now(),
            payloads_processed: 0,
            total_gas_used: 0,
            gigagas_per_second: None,
            samples_dropped: self.queue.dropped(),
            metrics: summary::summarize_samples(&self.samples_path).unwrap_or_default(),
            load: self.load_summary.take(),
            failure: Some(failure.clone()),
        };
        if let Err(err) =
            summary::write_summary(&self.cfg.outputs_dir.join("summary.json"), &run_summary)
        {
            warn!(%err, "failed to persist failure summary");
        }
        self.summary = Some(run_summary);
        Some(failure)
    }
}

/// Runs queued scenarios sequentially. One run's failure does not abort
/// the rest unless `stop_on_failure` says so.
pub async fn run_scenarios<S, D, L>(
    runners: Vec<ScenarioRunner<S, D, L>>,
    stop_on_failure: bool,
) -> Vec<ScenarioOutcome>
where
    S: Sandbox,
    D: PayloadDriver,
    L: LoadGenerator,
{
    let mut outcomes = Vec::with_capacity(runners.len());
    for runner in runners {
        let outcome = runner.run().await;
        let failed = outcome.state == ScenarioState::Failed;
        if failed {
            error!(scenario = %outcome.name, "scenario failed");
        }
        outcomes.push(outcome);
        if failed && stop_on_failure {
            warn!("stopping scenario queue on first failure");
            break;
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{
        ExitStatus,
        ResourceSample,
    };
    use alloy_primitives::B256;
    use std::{
        path::Path,
        sync::atomic::{
            AtomicBool,
            Ordering,
        },
    };
    use tokio::sync::watch;

    struct FakeSandbox {
        exit_tx: Arc<watch::Sender<Option<ExitStatus>>>,
        exit_rx: watch::Receiver<Option<ExitStatus>>,
        stopped: Arc<AtomicBool>,
    }

    impl FakeSandbox {
        fn new() -> (Self, Arc<watch::Sender<Option<ExitStatus>>>, Arc<AtomicBool>) {
            let (tx, rx) = watch::channel(None);
            let tx = Arc::new(tx);
            let stopped = Arc::new(AtomicBool::new(false));
            (
                Self {
                    exit_tx: Arc::clone(&tx),
                    exit_rx: rx,
                    stopped: Arc::clone(&stopped),
                },
                tx,
                stopped,
            )
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        async fn start(&mut self, _spec: ContainerSpec) -> Result<(), SandboxError> {
            Ok(())
        }

        fn exit_watcher(&self) -> watch::Receiver<Option<ExitStatus>> {
            self.exit_rx.clone()
        }

        async fn resource_sample(&self) -> Result<Option<ResourceSample>, SandboxError> {
            Ok(None)
        }

        async fn capture_logs(&self, dest: &Path) -> Result<(), SandboxError> {
            std::fs::write(dest, b"fake logs").map_err(|source| {
                SandboxError::Io {
                    path: dest.to_path_buf(),
                    source,
                }
            })
        }

        async fn stop(&mut self, _grace: Duration) -> Result<(), SandboxError> {
            self.stopped.store(true, Ordering::SeqCst);
            let _ = self.exit_tx.send(Some(0));
            Ok(())
        }
    }

    enum DriveBehavior {
        Succeed { samples: u64 },
        Hang,
        Invalid { index: u64 },
    }

    struct FakeDriver {
        ready: bool,
        behavior: DriveBehavior,
    }

    #[async_trait]
    impl PayloadDriver for FakeDriver {
        async fn wait_ready(
            &mut self,
            _retry: BackoffPolicy,
            _deadline: Duration,
        ) -> Result<(), ScenarioError> {
            if self.ready {
                Ok(())
            } else {
                std::future::pending().await
            }
        }

        async fn drive(&mut self, samples: Arc<SampleQueue>) -> Result<DriveOutcome, DriveError> {
            match &self.behavior {
                DriveBehavior::Succeed { samples: count } => {
                    for i in 0..*count {
                        samples.push(
                            MetricSample::new("new_payload_latency_us", 1000.0 + i as f64)
                                .with_index(i),
                        );
                        samples.push(
                            MetricSample::new(ACCEPTED_SAMPLE, 1.0)
                                .with_index(i)
                                .with_tag("block_hash", B256::repeat_byte(i as u8).to_string()),
                        );
                    }
                    Ok(DriveOutcome {
                        combined: vec![],
                        gas_rows: vec![],
                        last_accepted: Some((count.saturating_sub(1), B256::ZERO)),
                    })
                }
                DriveBehavior::Hang => std::future::pending().await,
                DriveBehavior::Invalid { index } => {
                    Err(DriveError::InvalidPayload {
                        index: *index,
                        number: *index + 1,
                        hash: B256::repeat_byte(0xab),
                        validation_error: "bad state root".to_string(),
                        latest_valid_hash: None,
                    })
                }
            }
        }
    }

    struct NoopLoad;

    #[async_trait]
    impl LoadGenerator for NoopLoad {
        async fn start(&mut self, _spec: &LoadSpec) -> Result<(), LoadGenError> {
            Ok(())
        }

        async fn wait(&mut self) -> Result<LoadSummary, LoadGenError> {
            Ok(LoadSummary {
                requests: 0,
                failed: 0,
                duration_seconds: 0.0,
            })
        }

        async fn stop(&mut self) -> Result<(), LoadGenError> {
            Ok(())
        }
    }

    fn config(dir: &Path) -> ScenarioConfig {
        ScenarioConfig {
            name: "test-scenario".to_string(),
            client_label: "fake".to_string(),
            client_spec: ContainerSpec {
                image: "fake:latest".to_string(),
                name: "fake-client".to_string(),
                command: vec![],
                env: vec![],
                mounts: vec![],
                published_ports: vec![],
                network: None,
                limits: Default::default(),
                pull: false,
            },
            outputs_dir: dir.to_path_buf(),
            readiness: BackoffPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10)),
            readiness_deadline: Duration::from_millis(200),
            drain_grace: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
            sample_queue_capacity: 256,
            sink_retry: BackoffPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
            resource_sample_interval: Duration::from_secs(60),
            remote_sink: None,
            load: None,
        }
    }

    fn runner(
        dir: &Path,
        behavior: DriveBehavior,
        ready: bool,
    ) -> (
        ScenarioRunner<FakeSandbox, FakeDriver, NoopLoad>,
        Arc<watch::Sender<Option<ExitStatus>>>,
        Arc<AtomicBool>,
    ) {
        let (sandbox, exit_tx, stopped) = FakeSandbox::new();
        let runner = ScenarioRunner::new(
            config(dir),
            sandbox,
            FakeDriver { ready, behavior },
            None,
        );
        (runner, exit_tx, stopped)
    }

    #[tokio::test]
    async fn happy_path_reaches_done_with_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _exit, stopped) = runner(dir.path(), DriveBehavior::Succeed { samples: 3 }, true);

        let outcome = runner.run().await;
        assert_eq!(outcome.state, ScenarioState::Done);
        let summary = outcome.summary.unwrap();
        assert!(summary.succeeded);
        assert_eq!(summary.samples_dropped, 0);
        assert!(summary.metrics.contains_key("new_payload_latency_us"));
        assert!(stopped.load(Ordering::SeqCst));

        // Draining flushed every queued sample into the durable log.
        let lines = std::fs::read_to_string(dir.path().join("samples.jsonl")).unwrap();
        assert_eq!(lines.lines().count(), 6);
        assert!(dir.path().join("summary.json").is_file());
        assert!(dir.path().join("fake.log").is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn client_crash_during_driving_fails_never_done() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, exit_tx, stopped) = runner(dir.path(), DriveBehavior::Hang, true);

        tokio::spawn({
            let exit_tx = Arc::clone(&exit_tx);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = exit_tx.send(Some(137));
            }
        });

        let outcome = runner.run().await;
        assert_eq!(outcome.state, ScenarioState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.stage, "driving");
        assert!(failure.message.contains("137"));
        assert!(stopped.load(Ordering::SeqCst));

        let summary = outcome.summary.unwrap();
        assert!(!summary.succeeded);
    }

    #[tokio::test]
    async fn invalid_payload_failure_names_stage_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, _exit, _stopped) =
            runner(dir.path(), DriveBehavior::Invalid { index: 3 }, true);

        let outcome = runner.run().await;
        assert_eq!(outcome.state, ScenarioState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.stage, "driving");
        assert_eq!(failure.payload_index, Some(3));
        assert!(dir.path().join("summary.json").is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_deadline_fails_warming() {
        let dir = tempfile::tempdir().unwrap();
        let (mut runner, _exit, _stopped) =
            runner(dir.path(), DriveBehavior::Succeed { samples: 0 }, false);
        // A driver that never reports ready must trip the deadline, not
        // hang the run.
        runner.cfg.readiness_deadline = Duration::from_millis(100);

        let outcome = runner.run().await;
        assert_eq!(outcome.state, ScenarioState::Failed);
        assert_eq!(outcome.failure.unwrap().stage, "warming");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_respects_the_grace_deadline() {
        struct StallSink;

        #[async_trait]
        impl MetricSink for StallSink {
            fn name(&self) -> &str {
                "stall"
            }

            async fn push(&self, _sample: &MetricSample) -> Result<(), SinkError> {
                std::future::pending().await
            }
        }

        let queue = SampleQueue::new(8);
        queue.push(MetricSample::new("x", 1.0));
        queue.close();
        let mut handle = tokio::spawn(run_fanout(
            Arc::clone(&queue),
            vec![Box::new(StallSink)],
            BackoffPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        ));

        assert_eq!(drain_fanout(&mut handle, Duration::from_millis(50)).await, None);

        // A healthy fan-out drains well within the grace period.
        let queue = SampleQueue::new(8);
        queue.close();
        let mut handle = tokio::spawn(run_fanout(queue, vec![], BackoffPolicy::default()));
        assert_eq!(drain_fanout(&mut handle, Duration::from_secs(1)).await, Some(0));
    }

    #[tokio::test]
    async fn queued_runs_continue_past_an_isolated_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (fail, _e1, _s1) = runner(&dir.path().join("a"), DriveBehavior::Invalid { index: 0 }, true);
        let (ok, _e2, _s2) = runner(&dir.path().join("b"), DriveBehavior::Succeed { samples: 1 }, true);

        let outcomes = run_scenarios(vec![fail, ok], false).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].state, ScenarioState::Failed);
        assert_eq!(outcomes[1].state, ScenarioState::Done);

        let (fail, _e3, _s3) = runner(&dir.path().join("c"), DriveBehavior::Invalid { index: 0 }, true);
        let (ok, _e4, _s4) = runner(&dir.path().join("d"), DriveBehavior::Succeed { samples: 1 }, true);
        let outcomes = run_scenarios(vec![fail, ok], true).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].state, ScenarioState::Failed);
    }
}
