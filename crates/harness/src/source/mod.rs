//! # Chain source adapter
//!
//! Fetches historical blocks from a read-only chain RPC and converts them
//! into the canonical payload/forkchoice record stream. The block range is
//! partitioned into contiguous shards drained by a bounded pool; within a
//! shard a second bounded pool issues the per-block requests. Both pools
//! are ordered streams, so output order is decided by block index and
//! never by completion order — re-running the same range against a stable
//! chain produces byte-identical records.

use crate::retry::{
    BackoffPolicy,
    with_backoff,
};
use alloy_consensus::{
    Block as ConsensusBlock,
    BlockBody,
    TxEnvelope,
};
use alloy_primitives::B256;
use alloy_provider::{
    Provider,
    ProviderBuilder,
    RootProvider,
};
use alloy_rpc_types_engine::ExecutionPayload;
use alloy_rpc_types_eth::Block as RpcBlock;
use futures::{
    StreamExt,
    TryStreamExt,
    stream,
};
use payload_store::{
    PayloadRecord,
    StoreError,
    StoreWriter,
};
use std::path::{
    Path,
    PathBuf,
};
use tracing::{
    debug,
    info,
};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid block range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("failed to connect to chain rpc {url}: {message}")]
    Connect { url: Url, message: String },

    #[error("rpc request for block {number} failed: {message}")]
    Rpc { number: u64, message: String },

    #[error("block {number} not found on the chain endpoint")]
    NotFound { number: u64 },

    #[error("block {number} was returned without full transaction bodies")]
    NotFullBlock { number: u64 },

    #[error("broken parent chain between blocks {previous} and {number}")]
    BrokenChain { previous: u64, number: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run-scoped fetch configuration, threaded explicitly into [`fetch_range`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub rpc_url: Url,
    /// Network label, used only for artifact naming and logging.
    pub network: String,
    pub start_block: u64,
    pub end_block: u64,
    /// Contiguous blocks per shard.
    pub shard_size: u64,
    /// Shards fetched concurrently.
    pub shard_concurrency: usize,
    /// Per-block requests in flight inside one shard.
    pub workers_per_shard: usize,
    pub retry: BackoffPolicy,
}

impl SourceConfig {
    pub fn new(rpc_url: Url, network: impl Into<String>, start_block: u64, end_block: u64) -> Self {
        Self {
            rpc_url,
            network: network.into(),
            start_block,
            end_block,
            shard_size: 32,
            shard_concurrency: 4,
            workers_per_shard: 8,
            retry: BackoffPolicy::default(),
        }
    }

    fn validate(&self) -> Result<(), SourceError> {
        if self.start_block > self.end_block || self.shard_size == 0 {
            return Err(SourceError::InvalidRange {
                start: self.start_block,
                end: self.end_block,
            });
        }
        Ok(())
    }
}

/// Everything extracted from one block before it becomes a record.
struct BlockParts {
    number: u64,
    payload: ExecutionPayload,
    blob_versioned_hashes: Vec<B256>,
    parent_beacon_block_root: Option<B256>,
}

/// Splits `[start, end]` into contiguous inclusive shards.
fn partition(start: u64, end: u64, shard_size: u64) -> Vec<(u64, u64)> {
    let mut shards = Vec::new();
    let mut lo = start;
    while lo <= end {
        let hi = lo.saturating_add(shard_size - 1).min(end);
        shards.push((lo, hi));
        if hi == end {
            break;
        }
        lo = hi + 1;
    }
    shards
}

fn convert_block(block: RpcBlock) -> Result<BlockParts, SourceError> {
    let number = block.header.number;
    let tx_count = block.transactions.len();

    let RpcBlock {
        header,
        transactions,
        withdrawals,
        ..
    } = block;

    let transactions: Vec<TxEnvelope> = transactions
        .into_transactions()
        .into_iter()
        .map(|tx| tx.inner.into_inner())
        .collect();
    if transactions.len() != tx_count {
        return Err(SourceError::NotFullBlock { number });
    }

    let block = ConsensusBlock {
        header: header.inner,
        body: BlockBody {
            transactions,
            ommers: Vec::new(),
            withdrawals,
        },
    };

    let blob_versioned_hashes = block.body.blob_versioned_hashes_iter().copied().collect();
    let parent_beacon_block_root = block.header.parent_beacon_block_root;
    let (payload, _) = ExecutionPayload::from_block_slow(&block);

    Ok(BlockParts {
        number,
        payload,
        blob_versioned_hashes,
        parent_beacon_block_root,
    })
}

async fn fetch_block(
    provider: RootProvider,
    number: u64,
    retry: BackoffPolicy,
) -> Result<BlockParts, SourceError> {
    let block = with_backoff(retry, "block fetch", || {
        let provider = provider.clone();
        async move {
            provider
                .get_block_by_number(number.into())
                .full()
                .await
                .map_err(|e| {
                    SourceError::Rpc {
                        number,
                        message: e.to_string(),
                    }
                })
        }
    })
    .await?
    .ok_or(SourceError::NotFound { number })?;

    convert_block(block)
}

async fn fetch_shard(
    provider: RootProvider,
    shard: (u64, u64),
    workers: usize,
    retry: BackoffPolicy,
) -> Result<Vec<BlockParts>, SourceError> {
    let (lo, hi) = shard;
    debug!(lo, hi, "fetching shard");
    stream::iter((lo..=hi).map(|number| fetch_block(provider.clone(), number, retry)))
        .buffered(workers.max(1))
        .try_collect()
        .await
}

/// Fetches `[start_block, end_block]` and returns the chain-validated,
/// order-preserving record sequence. The first exhausted retry fails the
/// whole run and cancels in-flight work — a partial stream is useless to
/// every downstream stage.
pub async fn fetch_range(cfg: &SourceConfig) -> Result<Vec<PayloadRecord>, SourceError> {
    cfg.validate()?;

    let provider: RootProvider = ProviderBuilder::new()
        .connect(cfg.rpc_url.as_str())
        .await
        .map_err(|e| {
            SourceError::Connect {
                url: cfg.rpc_url.clone(),
                message: e.to_string(),
            }
        })?
        .root()
        .clone();

    info!(
        network = %cfg.network,
        start = cfg.start_block,
        end = cfg.end_block,
        shards = partition(cfg.start_block, cfg.end_block, cfg.shard_size).len(),
        "fetching block range"
    );

    let shards = partition(cfg.start_block, cfg.end_block, cfg.shard_size);
    let fetched: Vec<Vec<BlockParts>> = stream::iter(
        shards
            .into_iter()
            .map(|shard| fetch_shard(provider.clone(), shard, cfg.workers_per_shard, cfg.retry)),
    )
    .buffered(cfg.shard_concurrency.max(1))
    .try_collect()
    .await?;

    let mut records: Vec<PayloadRecord> = Vec::new();
    for parts in fetched.into_iter().flatten() {
        let record = PayloadRecord::new(
            records.len() as u64,
            parts.payload,
            parts.blob_versioned_hashes,
            parts.parent_beacon_block_root,
        );
        if let Some(prev) = records.last()
            && !record.follows(prev)
        {
            return Err(SourceError::BrokenChain {
                previous: prev.block_number(),
                number: parts.number,
            });
        }
        records.push(record);
    }

    info!(records = records.len(), "block range fetched");
    Ok(records)
}

/// Fetches a range and appends it to a fresh record stream at `path`.
/// The file only becomes visible under its final name once complete.
pub async fn fetch_to_store(
    cfg: &SourceConfig,
    path: &Path,
) -> Result<(PathBuf, u64), SourceError> {
    let records = fetch_range(cfg).await?;
    let mut writer = StoreWriter::create(path)?;
    for record in &records {
        writer.append(record)?;
    }
    Ok(writer.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partition_covers_range_without_overlap() {
        assert_eq!(partition(0, 9, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(partition(5, 5, 32), vec![(5, 5)]);
        assert_eq!(partition(0, 31, 32), vec![(0, 31)]);
    }

    #[test]
    fn convert_block_extracts_payload_fields() {
        let block: RpcBlock = serde_json::from_value(json!({
            "hash": format!("0x{}", "22".repeat(32)),
            "parentHash": format!("0x{}", "11".repeat(32)),
            "sha3Uncles": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
            "miner": "0x0000000000000000000000000000000000000000",
            "stateRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
            "transactionsRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
            "receiptsRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
            "logsBloom": format!("0x{:0512}", 0),
            "difficulty": "0x0",
            "number": "0x10",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "timestamp": "0xc0",
            "extraData": "0x",
            "mixHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "nonce": "0x0000000000000000",
            "baseFeePerGas": "0x7",
            "size": "0x21c",
            "transactions": [],
            "uncles": []
        }))
        .unwrap();

        let parts = convert_block(block).unwrap();
        assert_eq!(parts.number, 0x10);
        let record = PayloadRecord::new(
            0,
            parts.payload,
            parts.blob_versioned_hashes,
            parts.parent_beacon_block_root,
        );
        assert_eq!(record.block_number(), 0x10);
        assert_eq!(record.parent_hash(), B256::repeat_byte(0x11));
        assert_eq!(record.block_hash(), B256::repeat_byte(0x22));
        assert_eq!(record.gas_used(), 21_000);
        assert_eq!(record.forkchoice.head_block_hash, B256::repeat_byte(0x22));
    }

    #[test]
    fn invalid_range_is_rejected() {
        let cfg = SourceConfig::new(
            Url::parse("http://localhost:8545").unwrap(),
            "mainnet",
            10,
            5,
        );
        assert!(matches!(
            cfg.validate(),
            Err(SourceError::InvalidRange { start: 10, end: 5 })
        ));
    }
}
