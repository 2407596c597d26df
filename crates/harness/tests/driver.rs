//! Driver protocol tests against the mock engine endpoint: strict
//! ordering, payload/forkchoice pairing, and the SYNCING/INVALID paths.

use assert_matches::assert_matches;
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
use enginebench::{
    driver::{
        self,
        DriveError,
        DriverConfig,
    },
    telemetry::SampleQueue,
};
use payload_store::{
    PayloadRecord,
    StoreError,
};
use std::time::Duration;
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

fn records(n: u64) -> impl Iterator<Item = Result<PayloadRecord, StoreError>> {
    chain_records(n).into_iter().map(Ok)
}

fn fast_config() -> DriverConfig {
    DriverConfig {
        syncing_retry_delay: Duration::from_millis(5),
        syncing_retry_max_delay: Duration::from_millis(20),
        syncing_deadline: Duration::from_millis(500),
        payload_delay: None,
    }
}

#[tokio::test]
async fn calls_are_strictly_ordered_and_paired() {
    let server = MockEngineServer::start().await;
    let queue = SampleQueue::new(64);

    let outcome = driver::drive(
        &client(&server),
        records(3),
        &DriverConfig::default(),
        Some(&queue),
    )
    .await
    .unwrap();
    assert_eq!(outcome.combined.len(), 3);

    assert_eq!(
        server.methods(),
        vec![
            "engine_newPayloadV1",
            "engine_forkchoiceUpdatedV1",
            "engine_newPayloadV1",
            "engine_forkchoiceUpdatedV1",
            "engine_newPayloadV1",
            "engine_forkchoiceUpdatedV1",
        ]
    );

    let calls = server.calls();
    assert!(calls.iter().all(|c| c.authorized));

    // Submissions arrive in increasing block order and each forkchoice
    // head is exactly the payload that preceded it.
    let expected = chain_records(3);
    let numbers: Vec<u64> = calls.iter().filter_map(|c| c.block_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    let heads: Vec<String> = calls.iter().filter_map(|c| c.head_block_hash.clone()).collect();
    let expected_heads: Vec<String> = expected
        .iter()
        .map(|r| r.block_hash().to_string())
        .collect();
    assert_eq!(heads, expected_heads);

    // Four samples per payload: accepted marker, both latencies, gas rate.
    assert_eq!(queue.len(), 12);
}

#[tokio::test]
async fn invalid_payload_stops_the_run_immediately() {
    let server = MockEngineServer::start().await;
    server.script_payload_status(2, &["INVALID"]);

    let err = driver::drive(&client(&server), records(3), &fast_config(), None)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        DriveError::InvalidPayload {
            index: 1,
            number: 2,
            ..
        }
    );

    // No forkchoice for the invalid payload, and nothing for its
    // successor.
    assert_eq!(
        server.methods(),
        vec![
            "engine_newPayloadV1",
            "engine_forkchoiceUpdatedV1",
            "engine_newPayloadV1",
        ]
    );
}

#[tokio::test]
async fn syncing_is_retried_until_valid() {
    let server = MockEngineServer::start().await;
    server.script_payload_status(1, &["SYNCING", "SYNCING", "VALID"]);

    let outcome = driver::drive(&client(&server), records(1), &fast_config(), None)
        .await
        .unwrap();
    assert_eq!(outcome.combined.len(), 1);

    // Three submissions of block 1, then its forkchoice update.
    assert_eq!(
        server.methods(),
        vec![
            "engine_newPayloadV1",
            "engine_newPayloadV1",
            "engine_newPayloadV1",
            "engine_forkchoiceUpdatedV1",
        ]
    );
}

#[tokio::test]
async fn syncing_past_the_deadline_fails_the_run() {
    let server = MockEngineServer::start().await;
    server.script_payload_status(1, &["SYNCING"]);

    let cfg = DriverConfig {
        syncing_deadline: Duration::from_millis(100),
        ..fast_config()
    };
    let err = driver::drive(&client(&server), records(1), &cfg, None)
        .await
        .unwrap_err();
    assert_matches!(err, DriveError::SyncingDeadline { index: 0, number: 1, .. });

    // The forkchoice call never went out.
    assert!(
        server
            .methods()
            .iter()
            .all(|m| m != "engine_forkchoiceUpdatedV1")
    );
}

#[tokio::test]
async fn out_of_order_records_are_rejected() {
    let server = MockEngineServer::start().await;
    let mut shuffled = chain_records(2);
    shuffled.swap(0, 1);

    let err = driver::drive(
        &client(&server),
        shuffled.into_iter().map(Ok),
        &fast_config(),
        None,
    )
    .await
    .unwrap_err();
    assert_matches!(err, DriveError::OutOfOrder { .. });
}
