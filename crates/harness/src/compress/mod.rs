//! # Compression engine
//!
//! Rewrites runs of K consecutive historical payloads into fewer, denser
//! synthesized payloads while preserving transaction semantic validity.
//! Window transactions are concatenated in original order and replayed
//! through a disposable re-execution oracle in ceiling-bounded candidate
//! batches; whatever the oracle cannot replay is dropped and recorded,
//! with same-sender cascades inside the window. Output forkchoice updates
//! reference the synthesized chain head, never the original one.

pub mod oracle;
pub mod plan;

use alloy_consensus::{
    Transaction,
    TxEnvelope,
    transaction::SignerRecoverable,
};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::Bytes;
use alloy_rpc_types_engine::ExecutionPayload;
use payload_store::{
    PayloadRecord,
    StoreError,
    StoreWriter,
};
use std::{
    collections::HashSet,
    io::Write,
    path::{
        Path,
        PathBuf,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

pub use oracle::{
    EngineReplayOracle,
    OracleError,
    OracleHead,
    ReplayOracle,
};
pub use plan::{
    DropReason,
    DroppedTx,
    SourceTx,
    WindowPlan,
};

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("compression factor must be at least 1, got {0}")]
    InvalidFactor(usize),

    #[error("transaction {index} in block {block} cannot be decoded: {message}")]
    UndecodableTx {
        block: u64,
        index: usize,
        message: String,
    },

    #[error("transaction {index} in block {block} has no recoverable sender: {message}")]
    UnrecoverableSender {
        block: u64,
        index: usize,
        message: String,
    },

    #[error("gas limit ramp did not reach {target} within {limit} blocks")]
    RampExhausted { target: u64, limit: u64 },

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error writing drop ledger {path}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run-scoped compression configuration.
#[derive(Debug, Clone)]
pub struct CompressConfig {
    /// Window size K: consecutive source payloads merged together.
    pub factor: usize,
    /// Cumulative declared-gas ceiling per output payload.
    pub gas_ceiling: u64,
    /// Whether blob-carrying transactions survive into the output.
    pub include_blobs: bool,
    /// Upper bound on empty ramp blocks driven through the oracle while
    /// its chain gas limit climbs toward the ceiling.
    pub max_ramp_blocks: u64,
}

impl CompressConfig {
    pub fn new(factor: usize, gas_ceiling: u64) -> Self {
        Self {
            factor,
            gas_ceiling,
            include_blobs: false,
            max_ramp_blocks: 20_000,
        }
    }
}

/// What one compression run did.
#[derive(Debug, Default)]
pub struct CompressReport {
    pub input_records: u64,
    pub windows: u64,
    pub ramp_records: u64,
    pub output_records: u64,
    pub dropped: Vec<DroppedTx>,
}

/// Wraps an oracle-built payload into a record. V3 payloads need a parent
/// beacon root for resubmission; the synthesized chain has no beacon, so
/// the payload's parent hash stands in for it, as the oracle client
/// expects.
pub fn synthesized_record(sequence: u64, payload: ExecutionPayload) -> PayloadRecord {
    let parent_beacon_block_root = match &payload {
        ExecutionPayload::V3(p) => Some(p.payload_inner.payload_inner.parent_hash),
        _ => None,
    };
    PayloadRecord::new(sequence, payload, vec![], parent_beacon_block_root)
}

/// Decodes a window's transactions in original order, recovering sender
/// identity for the cascade bookkeeping.
fn window_transactions(window: &[PayloadRecord]) -> Result<Vec<SourceTx>, CompressError> {
    let mut transactions = Vec::new();
    for record in window {
        let block = record.block_number();
        for (index, raw) in record.transactions().iter().enumerate() {
            let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).map_err(|e| {
                CompressError::UndecodableTx {
                    block,
                    index,
                    message: e.to_string(),
                }
            })?;
            let sender = envelope.recover_signer().map_err(|e| {
                CompressError::UnrecoverableSender {
                    block,
                    index,
                    message: e.to_string(),
                }
            })?;
            transactions.push(SourceTx {
                raw: raw.clone(),
                hash: *envelope.tx_hash(),
                sender,
                gas_limit: envelope.gas_limit(),
                is_blob: envelope.is_eip4844(),
                source_block: block,
            });
        }
    }
    Ok(transactions)
}

/// Drives empty blocks through the oracle until its chain gas limit
/// reaches the ceiling. Clients move the limit a bounded step per block,
/// so a large ceiling takes many blocks; every ramp block is part of the
/// output stream.
async fn ramp_gas_limit<O: ReplayOracle + ?Sized>(
    cfg: &CompressConfig,
    oracle: &mut O,
    out: &mut StoreWriter,
    sequence: &mut u64,
) -> Result<u64, CompressError> {
    let head = oracle.head().await?;
    let mut gas_limit = head.gas_limit;
    let mut ramped = 0u64;
    if gas_limit >= cfg.gas_ceiling {
        return Ok(0);
    }
    info!(
        current = gas_limit,
        target = cfg.gas_ceiling,
        "ramping oracle gas limit"
    );
    while gas_limit < cfg.gas_ceiling {
        if ramped >= cfg.max_ramp_blocks {
            return Err(CompressError::RampExhausted {
                target: cfg.gas_ceiling,
                limit: cfg.max_ramp_blocks,
            });
        }
        let payload = oracle.build_next(Vec::new()).await?;
        let record = synthesized_record(*sequence, payload);
        gas_limit = record.gas_limit();
        out.append(&record)?;
        *sequence += 1;
        ramped += 1;
        if ramped % 1000 == 0 {
            debug!(gas_limit, target = cfg.gas_ceiling, ramped, "gas limit ramp progress");
        }
    }
    info!(ramped, gas_limit, "oracle gas limit reached ceiling");
    Ok(ramped)
}

/// Replays one window, emitting between 1 and K output records. Returns
/// the output count and the window's drop ledger.
async fn compress_window<O: ReplayOracle + ?Sized>(
    cfg: &CompressConfig,
    oracle: &mut O,
    window: &[PayloadRecord],
    out: &mut StoreWriter,
    sequence: &mut u64,
) -> Result<(u64, Vec<DroppedTx>), CompressError> {
    let transactions = window_transactions(window)?;
    let submitted = transactions.len();
    let mut plan = WindowPlan::new(transactions, cfg.gas_ceiling, cfg.include_blobs);
    let mut outputs = 0u64;

    while !plan.is_empty() {
        if outputs as usize == cfg.factor {
            // Output cap reached: drop the remainder inside this window
            // rather than exceeding the input count or spilling onward.
            plan.drain_overflow();
            break;
        }
        let batch = plan.next_batch();
        if batch.is_empty() {
            break;
        }
        let raws: Vec<Bytes> = batch.iter().map(|tx| tx.raw.clone()).collect();
        let payload = oracle.build_next(raws).await?;
        let record = synthesized_record(*sequence, payload);

        let included: HashSet<&Bytes> = record.transactions().iter().collect();
        for tx in &batch {
            if !included.contains(&tx.raw) {
                plan.reject(tx);
            }
        }

        out.append(&record)?;
        *sequence += 1;
        outputs += 1;
    }

    if outputs == 0 {
        // A window with nothing replayable still yields one empty block so
        // the output stream keeps the window's place in the chain.
        let payload = oracle.build_next(Vec::new()).await?;
        out.append(&synthesized_record(*sequence, payload))?;
        *sequence += 1;
        outputs = 1;
    }

    let dropped = plan.into_dropped();
    debug!(
        first_block = window.first().map(|r| r.block_number()).unwrap_or_default(),
        inputs = window.len(),
        submitted,
        outputs,
        dropped = dropped.len(),
        "window compressed"
    );
    Ok((outputs, dropped))
}

/// Groups records into windows of at most `factor`, forcing an early
/// boundary whenever the payload version changes mid-stream. No window
/// ever mixes engine methods.
fn split_windows(records: Vec<PayloadRecord>, factor: usize) -> Vec<Vec<PayloadRecord>> {
    let mut windows = Vec::new();
    let mut current: Vec<PayloadRecord> = Vec::with_capacity(factor);
    for record in records {
        if let Some(first) = current.first()
            && first.version() != record.version()
        {
            windows.push(std::mem::take(&mut current));
        }
        current.push(record);
        if current.len() == factor {
            windows.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

/// Compresses an ordered record stream into `out`.
///
/// Windows are K consecutive inputs; the final window may be short.
pub async fn compress_stream<O: ReplayOracle + ?Sized>(
    cfg: &CompressConfig,
    oracle: &mut O,
    records: Vec<PayloadRecord>,
    out: &mut StoreWriter,
) -> Result<CompressReport, CompressError> {
    if cfg.factor == 0 {
        return Err(CompressError::InvalidFactor(0));
    }

    let mut report = CompressReport {
        input_records: records.len() as u64,
        ..Default::default()
    };
    let mut sequence = 0u64;

    report.ramp_records = ramp_gas_limit(cfg, oracle, out, &mut sequence).await?;

    for window in split_windows(records, cfg.factor) {
        let (outputs, dropped) =
            compress_window(cfg, oracle, &window, out, &mut sequence).await?;
        report.windows += 1;
        report.output_records += outputs;
        report.dropped.extend(dropped);
    }

    if !report.dropped.is_empty() {
        warn!(
            dropped = report.dropped.len(),
            "transactions were dropped during compression"
        );
    }
    info!(
        inputs = report.input_records,
        windows = report.windows,
        ramp = report.ramp_records,
        outputs = report.output_records,
        "compression finished"
    );
    Ok(report)
}

/// Persists the drop ledger as JSONL next to the output stream.
pub fn write_drop_ledger(path: &Path, dropped: &[DroppedTx]) -> Result<(), CompressError> {
    let wrap = |source| {
        CompressError::Ledger {
            path: path.to_path_buf(),
            source,
        }
    };
    let mut file = std::io::BufWriter::new(std::fs::File::create(path).map_err(wrap)?);
    for entry in dropped {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other).map_err(wrap)?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(wrap)?;
    }
    file.flush().map_err(wrap)?;
    Ok(())
}
