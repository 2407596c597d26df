//! # Engine API driver
//!
//! Submits a record stream to the client under test in strict causal
//! order: payload *i+1* is only well-defined once payload *i* is
//! canonical, so submission is single-threaded by design, never a tuning
//! choice. Every call pair is timed; samples go out through the bounded
//! telemetry queue and never gate submission.

use crate::{
    metrics::PayloadMetrics,
    output::{
        CombinedResult,
        NewPayloadResult,
        TotalGasOutput,
        TotalGasRow,
    },
    telemetry::{
        MetricSample,
        SampleQueue,
    },
};
use alloy_primitives::B256;
use alloy_rpc_types_engine::PayloadStatusEnum;
use engine_client::{
    EngineApiError,
    EngineClient,
};
use payload_store::{
    PayloadRecord,
    StoreError,
};
use std::time::{
    Duration,
    Instant,
};
use tracing::{
    debug,
    info,
};

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error(transparent)]
    Engine(#[from] EngineApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(
        "client reported payload {index} (block {number}, hash {hash}) INVALID: {validation_error}"
    )]
    InvalidPayload {
        index: u64,
        number: u64,
        hash: B256,
        validation_error: String,
        latest_valid_hash: Option<B256>,
    },

    #[error("payload {index} (block {number}) stuck {status} past the {deadline:?} deadline")]
    SyncingDeadline {
        index: u64,
        number: u64,
        status: String,
        deadline: Duration,
    },

    #[error("forkchoice update for payload {index} not acknowledged: {status}")]
    ForkchoiceRejected { index: u64, status: String },

    #[error("records out of order: got sequence {sequence} after {previous}")]
    OutOfOrder { sequence: u64, previous: u64 },
}

impl DriveError {
    /// Index of the payload the failure is anchored to, when there is one.
    pub fn payload_index(&self) -> Option<u64> {
        match self {
            Self::InvalidPayload { index, .. }
            | Self::SyncingDeadline { index, .. }
            | Self::ForkchoiceRejected { index, .. } => Some(*index),
            Self::OutOfOrder { sequence, .. } => Some(*sequence),
            Self::Engine(_) | Self::Store(_) => None,
        }
    }
}

/// Run-scoped driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// First retry delay while the client answers SYNCING/ACCEPTED;
    /// doubles per retry.
    pub syncing_retry_delay: Duration,
    /// Cap on the per-retry delay.
    pub syncing_retry_max_delay: Duration,
    /// Hard deadline per payload for leaving SYNCING/ACCEPTED.
    pub syncing_deadline: Duration,
    /// Optional pacing delay between payloads.
    pub payload_delay: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            syncing_retry_delay: Duration::from_millis(250),
            syncing_retry_max_delay: Duration::from_secs(5),
            syncing_deadline: Duration::from_secs(300),
            payload_delay: None,
        }
    }
}

/// Everything one drive produced.
#[derive(Debug, Default)]
pub struct DriveOutcome {
    pub combined: Vec<CombinedResult>,
    pub gas_rows: Vec<TotalGasRow>,
    /// Sequence and hash of the last payload the client accepted, for
    /// failure diagnostics.
    pub last_accepted: Option<(u64, B256)>,
}

impl DriveOutcome {
    pub fn total_gas(&self) -> Option<TotalGasOutput> {
        TotalGasOutput::new(&self.gas_rows)
    }
}

/// Submits a payload until the client answers VALID, retrying
/// SYNCING/ACCEPTED with doubling delays under the hard deadline. INVALID
/// fails immediately: continuing over invalid history is meaningless.
async fn submit_until_valid(
    client: &EngineClient,
    record: &PayloadRecord,
    cfg: &DriverConfig,
) -> Result<(), DriveError> {
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        let status = client.new_payload(record).await?;
        match &status.status {
            PayloadStatusEnum::Valid => return Ok(()),
            PayloadStatusEnum::Invalid { validation_error } => {
                return Err(DriveError::InvalidPayload {
                    index: record.sequence,
                    number: record.block_number(),
                    hash: record.block_hash(),
                    validation_error: validation_error.clone(),
                    latest_valid_hash: status.latest_valid_hash,
                });
            }
            PayloadStatusEnum::Syncing | PayloadStatusEnum::Accepted => {
                if started.elapsed() >= cfg.syncing_deadline {
                    return Err(DriveError::SyncingDeadline {
                        index: record.sequence,
                        number: record.block_number(),
                        status: format!("{:?}", status.status),
                        deadline: cfg.syncing_deadline,
                    });
                }
                let delay = cfg
                    .syncing_retry_delay
                    .saturating_mul(1u32 << attempt.min(16))
                    .min(cfg.syncing_retry_max_delay);
                debug!(
                    number = record.block_number(),
                    status = ?status.status,
                    ?delay,
                    "payload not yet validated, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Drives a record stream against the client under test.
///
/// Records must arrive in strictly increasing sequence order; the
/// forkchoice call for a payload is only issued after its VALID, and no
/// call for *i+1* ever precedes the forkchoice acknowledgment for *i*.
pub async fn drive<I>(
    client: &EngineClient,
    records: I,
    cfg: &DriverConfig,
    samples: Option<&SampleQueue>,
) -> Result<DriveOutcome, DriveError>
where
    I: IntoIterator<Item = Result<PayloadRecord, StoreError>>,
{
    let mut outcome = DriveOutcome::default();
    let mut previous: Option<u64> = None;
    let bench_start = Instant::now();

    for record in records {
        let record = record?;
        if let Some(previous) = previous
            && record.sequence <= previous
        {
            return Err(DriveError::OutOfOrder {
                sequence: record.sequence,
                previous,
            });
        }
        previous = Some(record.sequence);

        let mut payload_metrics = PayloadMetrics::new(record.block_number());
        payload_metrics.gas_used = record.gas_used();
        payload_metrics.transaction_count = record.transaction_count() as u64;

        let new_payload_start = Instant::now();
        submit_until_valid(client, &record, cfg).await?;
        let new_payload_latency = new_payload_start.elapsed();
        payload_metrics.new_payload_duration = new_payload_latency;

        let fcu_start = Instant::now();
        let updated = client
            .forkchoice_updated(record.version(), &record.forkchoice)
            .await?;
        if !updated.payload_status.is_valid() {
            return Err(DriveError::ForkchoiceRejected {
                index: record.sequence,
                status: format!("{:?}", updated.payload_status.status),
            });
        }
        let fcu_latency = fcu_start.elapsed();
        payload_metrics.fcu_duration = fcu_latency;
        drop(payload_metrics);

        outcome.last_accepted = Some((record.sequence, record.block_hash()));

        let result = CombinedResult {
            block_number: record.block_number(),
            gas_limit: record.gas_limit(),
            transaction_count: record.transaction_count() as u64,
            new_payload_result: NewPayloadResult {
                gas_used: record.gas_used(),
                latency: new_payload_latency,
            },
            fcu_latency,
            total_latency: new_payload_latency + fcu_latency,
        };
        info!(progress = outcome.combined.len() + 1, "{result}");

        if let Some(queue) = samples {
            queue.push(
                MetricSample::new(crate::telemetry::ACCEPTED_SAMPLE, 1.0)
                    .with_index(record.sequence)
                    .with_tag("block_hash", record.block_hash().to_string()),
            );
            queue.push(
                MetricSample::new(
                    "new_payload_latency_us",
                    new_payload_latency.as_micros() as f64,
                )
                .with_index(record.sequence)
                .with_tag("block_number", record.block_number().to_string()),
            );
            queue.push(
                MetricSample::new("fcu_latency_us", fcu_latency.as_micros() as f64)
                    .with_index(record.sequence),
            );
            queue.push(
                MetricSample::new("gas_per_second", result.new_payload_result.gas_per_second())
                    .with_index(record.sequence),
            );
        }

        outcome.gas_rows.push(TotalGasRow {
            block_number: record.block_number(),
            transaction_count: record.transaction_count() as u64,
            gas_used: record.gas_used(),
            time: bench_start.elapsed(),
        });
        outcome.combined.push(result);

        if let Some(delay) = cfg.payload_delay {
            tokio::time::sleep(delay).await;
        }
    }

    if let Some(total) = outcome.total_gas() {
        info!(
            blocks = total.blocks_processed,
            total_gas = total.total_gas_used,
            duration = ?total.total_duration,
            "drive finished at {:.4} Ggas/s",
            total.total_gigagas_per_second()
        );
    }
    Ok(outcome)
}
