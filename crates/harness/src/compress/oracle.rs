//! The disposable re-execution oracle.
//!
//! The oracle is a snapshot-seeded execution client whose patched engine
//! surface exposes a build-from-transactions call. Each build advances the
//! oracle's own chain, so candidates replay against exactly the state the
//! previous candidate left behind. Provisioning and teardown of the
//! underlying client belong to the sandbox; this module only speaks the
//! replay protocol.

use async_trait::async_trait;
use alloy_primitives::Bytes;
use alloy_rpc_types_engine::ExecutionPayload;
use engine_client::{
    EngineApiError,
    EngineClient,
};
use payload_store::EngineVersion;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error(transparent)]
    Engine(#[from] EngineApiError),

    /// The oracle refused a payload it built itself; its state has
    /// diverged and nothing further can be replayed against it.
    #[error("oracle rejected its own synthesized payload: {status}")]
    RejectedOwnPayload { status: String },
}

/// Current head of the oracle chain.
#[derive(Debug, Clone, Copy)]
pub struct OracleHead {
    pub number: u64,
    pub gas_limit: u64,
}

/// Replay surface the compression engine drives.
#[async_trait]
pub trait ReplayOracle: Send {
    fn version(&self) -> EngineVersion;

    /// Head of the oracle chain as it stands now.
    async fn head(&mut self) -> Result<OracleHead, OracleError>;

    /// Builds the next block from the given raw transactions, makes it the
    /// oracle's canonical head, and returns the synthesized payload.
    /// Transactions the oracle cannot replay are silently excluded; the
    /// caller diffs the payload against its input to find them.
    async fn build_next(
        &mut self,
        transactions: Vec<Bytes>,
    ) -> Result<ExecutionPayload, OracleError>;
}

/// Oracle backed by a real patched client over its engine surface.
pub struct EngineReplayOracle {
    client: EngineClient,
    version: EngineVersion,
}

impl EngineReplayOracle {
    pub fn new(client: EngineClient, version: EngineVersion) -> Self {
        Self { client, version }
    }
}

#[async_trait]
impl ReplayOracle for EngineReplayOracle {
    fn version(&self) -> EngineVersion {
        self.version
    }

    async fn head(&mut self) -> Result<OracleHead, OracleError> {
        let latest = self.client.latest_block().await?;
        Ok(OracleHead {
            number: latest.number.to::<u64>(),
            gas_limit: latest.gas_limit.to::<u64>(),
        })
    }

    async fn build_next(
        &mut self,
        transactions: Vec<Bytes>,
    ) -> Result<ExecutionPayload, OracleError> {
        let payload = self
            .client
            .build_payload(self.version, &transactions)
            .await?;

        // Canonicalize the candidate so the next one builds on top of it.
        let record = super::synthesized_record(0, payload.clone());
        let status = self.client.new_payload(&record).await?;
        if !status.is_valid() {
            return Err(OracleError::RejectedOwnPayload {
                status: format!("{:?}", status.status),
            });
        }
        let updated = self
            .client
            .forkchoice_updated(self.version, &record.forkchoice)
            .await?;
        if !updated.payload_status.is_valid() {
            return Err(OracleError::RejectedOwnPayload {
                status: format!("{:?}", updated.payload_status.status),
            });
        }

        debug!(
            number = record.block_number(),
            submitted = transactions.len(),
            included = record.transaction_count(),
            "oracle advanced"
        );
        Ok(payload)
    }
}
