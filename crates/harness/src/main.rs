use anyhow::Context;
use bollard::Docker;
use chrono::Utc;
use clap::Parser;
use engine_client::{
    EngineClient,
    EngineClientConfig,
    JwtProvider,
    auth::DEFAULT_TOKEN_VALIDITY_SECS,
};
use enginebench::{
    args::{
        Cli,
        ClientArg,
        Command,
        CompressArgs,
        GenerateArgs,
        RunArgs,
        RunManyArgs,
        ScenarioArgs,
        SendArgs,
    },
    compress::{
        self,
        CompressConfig,
        EngineReplayOracle,
    },
    driver::{
        self,
        DriverConfig,
    },
    loadgen::{
        ContainerLoadConfig,
        ContainerLoadGenerator,
        LoadSpec,
    },
    output,
    retry::{
        BackoffPolicy,
        with_backoff,
    },
    sandbox::{
        ContainerSpec,
        DockerNetwork,
        DockerSandbox,
        Mount,
        ResourceLimits,
        Sandbox,
    },
    scenario::{
        EngineStreamDriver,
        RemoteSinkConfig,
        ScenarioConfig,
        ScenarioRunner,
        ScenarioState,
        run_scenarios,
    },
    source,
};
use payload_store::{
    EngineVersion,
    StoreReader,
    StoreWriter,
};
use std::{
    path::Path,
    sync::Arc,
    time::Duration,
};
use tracing::{
    info,
    warn,
};
use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Generate(args) => generate(args).await,
        Command::Compress(args) => compress_cmd(args).await,
        Command::Run(args) => run(args).await,
        Command::RunMany(args) => run_many(args).await,
        Command::Send(args) => send(args).await,
    }
}

async fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    if let Some(parent) = args.output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let cfg = args.source_config();
    let (path, records) = source::fetch_to_store(&cfg, &args.output).await?;
    info!(path = %path.display(), records, "payload generation finished");
    Ok(())
}

async fn compress_cmd(args: CompressArgs) -> anyhow::Result<()> {
    let records = StoreReader::read_all(&args.input)?;
    anyhow::ensure!(!records.is_empty(), "input stream {} is empty", args.input.display());
    let version = records
        .first()
        .map(payload_store::PayloadRecord::version)
        .unwrap_or(EngineVersion::V3);

    std::fs::create_dir_all(&args.output_dir)?;
    let jwt_path = args.output_dir.join("jwtsecret.hex");
    std::fs::write(&jwt_path, JwtProvider::generate_secret())?;

    let docker = Arc::new(Docker::connect_with_local_defaults()?);
    let mut oracle_sandbox = DockerSandbox::new(Arc::clone(&docker), "enginebench-oracle");
    oracle_sandbox
        .start(ContainerSpec {
            image: args.oracle_image.clone(),
            name: "enginebench-oracle".to_string(),
            command: args.oracle_command.clone(),
            env: vec![],
            mounts: vec![
                Mount::read_write(&args.oracle_data_dir, "/data"),
                Mount::read_only(&jwt_path, "/jwt/jwtsecret.hex"),
            ],
            published_ports: vec![args.oracle_engine_port],
            network: None,
            limits: ResourceLimits {
                cpus: Some(args.sandbox.cpus),
                memory_bytes: Some(args.sandbox.mem_limit_bytes),
                download_rate: None,
                upload_rate: None,
            },
            pull: args.sandbox.pull_images,
        })
        .await?;

    let result = run_compression(&args, &jwt_path, version, records).await;

    // Teardown happens whether compression succeeded or not.
    let log_path = args.output_dir.join("oracle.log");
    if let Err(err) = oracle_sandbox.capture_logs(&log_path).await {
        warn!(%err, "oracle log capture failed");
    }
    if let Err(err) = oracle_sandbox.stop(Duration::from_secs(10)).await {
        warn!(%err, "oracle stop failed");
    }

    let report = result?;
    info!(
        inputs = report.input_records,
        outputs = report.output_records,
        ramp = report.ramp_records,
        dropped = report.dropped.len(),
        "payload compression finished"
    );
    Ok(())
}

async fn run_compression(
    args: &CompressArgs,
    jwt_path: &Path,
    version: EngineVersion,
    records: Vec<payload_store::PayloadRecord>,
) -> anyhow::Result<compress::CompressReport> {
    let engine_url = Url::parse(&format!("http://127.0.0.1:{}", args.oracle_engine_port))?;
    let auth = JwtProvider::from_file(jwt_path, DEFAULT_TOKEN_VALIDITY_SECS)?;
    let client = EngineClient::new(EngineClientConfig::new(engine_url), auth)?;

    let readiness = BackoffPolicy::new(16, Duration::from_millis(500), Duration::from_secs(10));
    let deadline = Duration::from_secs(args.readiness_deadline_secs);
    let latest = tokio::time::timeout(
        deadline,
        with_backoff(readiness, "oracle readiness", || client.block_number()),
    )
    .await
    .context("oracle readiness deadline elapsed")?
    .context("oracle json-rpc never became available")?;
    info!(latest_block = latest, "oracle is ready");

    let mut oracle = EngineReplayOracle::new(client, version);
    let cfg = CompressConfig {
        factor: args.compression_factor,
        gas_ceiling: args.gas_ceiling,
        include_blobs: args.include_blobs,
        max_ramp_blocks: args.max_ramp_blocks,
    };

    let mut out = StoreWriter::create(args.output_dir.join("records.jsonl"))?;
    let report = compress::compress_stream(&cfg, &mut oracle, records, &mut out).await?;
    out.finish()?;
    compress::write_drop_ledger(&args.output_dir.join("dropped.jsonl"), &report.dropped)?;
    Ok(report)
}

fn load_spec(scenario: &str, client_container: &str, args: &ScenarioArgs) -> Option<LoadSpec> {
    args.load_image.as_ref()?;
    Some(LoadSpec {
        scenario: scenario.to_string(),
        engine_url: format!("http://{client_container}:{}", args.engine_port),
        start_index: args.load_start,
        iterations: args.load_iterations,
        delay_seconds: args.load_delay_seconds,
        rate: args.load_rate,
        max_failure_rate: args.load_max_failure_rate,
    })
}

type DockerRunner = ScenarioRunner<DockerSandbox, EngineStreamDriver, ContainerLoadGenerator>;

/// Composes one scenario runner: outputs directory, shared secret, client
/// container spec, driver session, and (optionally) the load generator.
fn build_runner(
    docker: &Arc<Docker>,
    client: &ClientArg,
    name: &str,
    args: &ScenarioArgs,
    network: &str,
) -> anyhow::Result<DockerRunner> {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let outputs_dir = args.outputs_dir.join(format!("{name}-{timestamp}"));
    std::fs::create_dir_all(&outputs_dir)?;

    let jwt_path = outputs_dir.join("jwtsecret.hex");
    std::fs::write(&jwt_path, JwtProvider::generate_secret())?;

    let container_name = format!("enginebench-{name}-{}", client.label);
    let mut mounts = vec![
        Mount::read_write(&args.data_dir, &args.container_data_dir),
        Mount::read_only(&jwt_path, &args.container_jwt_path),
    ];
    if let Some(snapshot) = &args.snapshot_dir {
        mounts.push(Mount::read_only(snapshot, &args.container_snapshot_dir));
    }

    let client_spec = ContainerSpec {
        image: client.image.clone(),
        name: container_name.clone(),
        command: args.client_command.clone(),
        env: vec![],
        mounts,
        published_ports: vec![args.engine_port, args.rpc_port],
        network: Some(network.to_string()),
        limits: ResourceLimits {
            cpus: Some(args.sandbox.cpus),
            memory_bytes: Some(args.sandbox.mem_limit_bytes),
            download_rate: args.sandbox.download_rate.clone(),
            upload_rate: args.sandbox.upload_rate.clone(),
        },
        pull: args.sandbox.pull_images,
    };

    let remote_sink = args.remote_url.clone().map(|endpoint| {
        RemoteSinkConfig {
            endpoint,
            basic_auth: args
                .remote_user
                .clone()
                .map(|user| (user, args.remote_password.clone().unwrap_or_default())),
        }
    });

    let cfg = ScenarioConfig {
        name: name.to_string(),
        client_label: client.label.clone(),
        client_spec,
        outputs_dir: outputs_dir.clone(),
        readiness: BackoffPolicy::new(16, Duration::from_millis(500), Duration::from_secs(10)),
        readiness_deadline: Duration::from_secs(args.readiness_deadline_secs),
        drain_grace: Duration::from_secs(args.drain_grace_secs),
        stop_grace: Duration::from_secs(args.stop_grace_secs),
        sample_queue_capacity: args.queue_capacity,
        sink_retry: BackoffPolicy::default(),
        resource_sample_interval: Duration::from_secs(args.resource_interval_secs),
        remote_sink,
        load: load_spec(name, &container_name, args),
    };

    let engine_url = Url::parse(&format!("http://127.0.0.1:{}", args.engine_port))?;
    let driver_cfg = DriverConfig {
        syncing_deadline: Duration::from_secs(args.syncing_deadline_secs),
        payload_delay: args.payload_delay_ms.map(Duration::from_millis),
        ..Default::default()
    };
    let driver = EngineStreamDriver::new(
        engine_url,
        jwt_path.clone(),
        args.payloads.clone(),
        driver_cfg,
    );

    let sandbox = DockerSandbox::new(Arc::clone(docker), container_name);
    let mut runner = ScenarioRunner::new(cfg, sandbox, driver, None);

    if let Some(image) = &args.load_image {
        let load_sandbox =
            DockerSandbox::new(Arc::clone(docker), format!("enginebench-{name}-load"));
        let load_cfg = ContainerLoadConfig {
            image: image.clone(),
            payloads_file: args.payloads.clone(),
            jwt_secret_file: jwt_path,
            work_dir: outputs_dir,
            network: Some(network.to_string()),
        };
        runner.set_load(ContainerLoadGenerator::new(
            load_cfg,
            load_sandbox,
            runner.sample_queue(),
        ));
    }
    Ok(runner)
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let docker = Arc::new(Docker::connect_with_local_defaults()?);
    let name = args.name.clone().unwrap_or_else(|| args.client.label.clone());

    let network_name = format!("enginebench-{name}-network");
    let network = DockerNetwork::create(Arc::clone(&docker), network_name.clone()).await?;
    let runner = build_runner(&docker, &args.client, &name, &args.scenario, &network_name)?;

    let outcome = runner.run().await;
    if let Err(err) = network.remove().await {
        warn!(%err, "network removal failed");
    }

    report_outcomes(std::slice::from_ref(&outcome))
}

async fn run_many(args: RunManyArgs) -> anyhow::Result<()> {
    let docker = Arc::new(Docker::connect_with_local_defaults()?);

    let mut networks = Vec::new();
    let mut runners = Vec::new();
    for client in &args.clients {
        let name = client.label.clone();
        let network_name = format!("enginebench-{name}-network");
        networks.push(DockerNetwork::create(Arc::clone(&docker), network_name.clone()).await?);
        runners.push(build_runner(
            &docker,
            client,
            &name,
            &args.scenario,
            &network_name,
        )?);
    }

    let outcomes = run_scenarios(runners, args.stop_on_failure).await;

    for network in networks {
        if let Err(err) = network.remove().await {
            warn!(%err, "network removal failed");
        }
    }
    report_outcomes(&outcomes)
}

fn report_outcomes(outcomes: &[enginebench::ScenarioOutcome]) -> anyhow::Result<()> {
    let mut failed = 0usize;
    for outcome in outcomes {
        match outcome.state {
            ScenarioState::Done => {
                info!(
                    scenario = %outcome.name,
                    outputs = %outcome.outputs_dir.display(),
                    "scenario completed"
                );
            }
            _ => {
                failed += 1;
                if let Some(failure) = &outcome.failure {
                    warn!(
                        scenario = %outcome.name,
                        stage = %failure.stage,
                        payload_index = ?failure.payload_index,
                        "scenario failed: {}",
                        failure.message
                    );
                }
            }
        }
    }
    anyhow::ensure!(failed == 0, "{failed} scenario(s) failed");
    Ok(())
}

async fn send(args: SendArgs) -> anyhow::Result<()> {
    let auth = JwtProvider::from_file(&args.jwt_secret_file, DEFAULT_TOKEN_VALIDITY_SECS)?;
    let client = EngineClient::new(EngineClientConfig::new(args.engine_url.clone()), auth)?;
    let reader = StoreReader::open(&args.payloads)?;

    let cfg = DriverConfig {
        syncing_deadline: Duration::from_secs(args.syncing_deadline_secs),
        payload_delay: args.payload_delay_ms.map(Duration::from_millis),
        ..Default::default()
    };
    let outcome = driver::drive(&client, reader, &cfg, None).await?;

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
        output::write_benchmark_results(dir, &outcome.gas_rows, &outcome.combined)?;
    }
    Ok(())
}
