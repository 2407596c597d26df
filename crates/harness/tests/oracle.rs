//! Engine-backed oracle tests: the replay protocol against the mock
//! patched client — build, canonicalize, advance.

use bench_test_utils::{
    MockEngineServer,
    chain_records,
};
use engine_client::{
    EngineClient,
    EngineClientConfig,
    JwtProvider,
    auth::DEFAULT_TOKEN_VALIDITY_SECS,
};
use enginebench::compress::{
    self,
    CompressConfig,
    EngineReplayOracle,
};
use payload_store::{
    EngineVersion,
    StoreReader,
    StoreWriter,
};
use url::Url;

fn client(server: &MockEngineServer) -> EngineClient {
    let auth = JwtProvider::from_hex(&JwtProvider::generate_secret(), DEFAULT_TOKEN_VALIDITY_SECS)
        .unwrap();
    EngineClient::new(
        EngineClientConfig::new(Url::parse(&server.url()).unwrap()),
        auth,
    )
    .unwrap()
}

#[tokio::test]
async fn oracle_builds_and_canonicalizes_every_candidate() {
    let server = MockEngineServer::start().await;
    let ceiling = 1_000_000_000u64;
    server.set_oracle_gas(ceiling, 0);

    let mut oracle = EngineReplayOracle::new(client(&server), EngineVersion::V1);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compressed.jsonl");
    let mut out = StoreWriter::create(&path).unwrap();

    let cfg = CompressConfig::new(2, ceiling);
    let report = compress::compress_stream(&cfg, &mut oracle, chain_records(4), &mut out)
        .await
        .unwrap();
    out.finish().unwrap();

    assert_eq!(report.windows, 2);
    assert_eq!(report.output_records, 2);
    assert_eq!(report.ramp_records, 0);
    assert!(report.dropped.is_empty());

    // Every candidate went through build → submit → canonicalize, plus
    // the initial head probe.
    let methods = server.methods();
    let builds = methods.iter().filter(|m| *m == "engine_buildPayloadV1").count();
    let submits = methods.iter().filter(|m| *m == "engine_newPayloadV1").count();
    let forkchoices = methods
        .iter()
        .filter(|m| *m == "engine_forkchoiceUpdatedV1")
        .count();
    assert_eq!(builds, 2);
    assert_eq!(submits, 2);
    assert_eq!(forkchoices, 2);

    // The synthesized stream chains and respects the ceiling.
    let outputs = StoreReader::read_all(&path).unwrap();
    assert_eq!(outputs.len(), 2);
    for pair in outputs.windows(2) {
        assert!(pair[1].follows(&pair[0]));
    }
    for record in &outputs {
        assert!(record.gas_used() <= ceiling);
    }
}

#[tokio::test]
async fn ramp_drives_empty_blocks_through_the_oracle() {
    let server = MockEngineServer::start().await;
    // 100 → 600 → 1100 crosses the 1000 ceiling after two empty builds.
    server.set_oracle_gas(100, 500);

    let mut oracle = EngineReplayOracle::new(client(&server), EngineVersion::V1);
    let dir = tempfile::tempdir().unwrap();
    let mut out = StoreWriter::create(dir.path().join("compressed.jsonl")).unwrap();

    let cfg = CompressConfig::new(2, 1_000);
    let report = compress::compress_stream(&cfg, &mut oracle, chain_records(2), &mut out)
        .await
        .unwrap();
    let (_, count) = out.finish().unwrap();

    assert_eq!(report.ramp_records, 2);
    assert_eq!(report.windows, 1);
    // Two ramp blocks plus the window's output.
    assert_eq!(count, 3);
}
