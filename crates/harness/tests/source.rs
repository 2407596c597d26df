//! Source adapter tests against the mock chain endpoint: index-ordered
//! output regardless of completion order, chain validation, and
//! byte-identical refetches.

use assert_matches::assert_matches;
use bench_test_utils::MockEngineServer;
use enginebench::{
    retry::BackoffPolicy,
    source::{
        self,
        SourceConfig,
        SourceError,
    },
};
use std::time::Duration;
use url::Url;

fn config(server: &MockEngineServer, start: u64, end: u64) -> SourceConfig {
    let mut cfg = SourceConfig::new(
        Url::parse(&server.url()).unwrap(),
        "testnet",
        start,
        end,
    );
    cfg.shard_size = 2;
    cfg.shard_concurrency = 3;
    cfg.workers_per_shard = 2;
    cfg.retry = BackoffPolicy::new(2, Duration::from_millis(5), Duration::from_millis(5));
    cfg
}

#[tokio::test]
async fn fetch_emits_one_contiguous_record_per_block() {
    let server = MockEngineServer::start().await;
    server.seed_chain(0, 20);

    let records = source::fetch_range(&config(&server, 10, 14)).await.unwrap();
    assert_eq!(records.len(), 5);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.sequence, i as u64);
        assert_eq!(record.block_number(), 10 + i as u64);
    }
    for pair in records.windows(2) {
        assert!(pair[1].follows(&pair[0]));
        assert_eq!(pair[1].parent_hash(), pair[0].block_hash());
    }
}

#[tokio::test]
async fn refetching_the_same_range_is_byte_identical() {
    let server = MockEngineServer::start().await;
    server.seed_chain(0, 8);
    let dir = tempfile::tempdir().unwrap();

    let mut contents = Vec::new();
    for name in ["first.jsonl", "second.jsonl"] {
        let path = dir.path().join(name);
        let (written, count) = source::fetch_to_store(&config(&server, 3, 7), &path)
            .await
            .unwrap();
        assert_eq!(count, 5);
        contents.push(std::fs::read(written).unwrap());
    }
    assert_eq!(contents[0], contents[1]);
}

#[tokio::test]
async fn a_missing_block_fails_the_whole_run() {
    let server = MockEngineServer::start().await;
    server.seed_chain(10, 12);

    let err = source::fetch_range(&config(&server, 10, 14)).await.unwrap_err();
    assert_matches!(err, SourceError::NotFound { number: 13 });
}
