//! Record model shared by every pipeline stage.

use alloy_primitives::{
    B256,
    Bytes,
};
use alloy_rpc_types_engine::{
    ExecutionPayload,
    ExecutionPayloadV1,
    ForkchoiceState,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Engine API version a payload must be submitted with.
///
/// Mirrors the fork the payload was built under: pre-Shanghai payloads go
/// through the V1 methods, withdrawal-carrying payloads through V2, and
/// blob-era payloads through V3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EngineVersion {
    V1,
    V2,
    V3,
}

impl EngineVersion {
    /// JSON-RPC method for payload submission.
    pub fn new_payload_method(self) -> &'static str {
        match self {
            Self::V1 => "engine_newPayloadV1",
            Self::V2 => "engine_newPayloadV2",
            Self::V3 => "engine_newPayloadV3",
        }
    }

    /// JSON-RPC method for the paired forkchoice update.
    pub fn forkchoice_method(self) -> &'static str {
        match self {
            Self::V1 => "engine_forkchoiceUpdatedV1",
            Self::V2 => "engine_forkchoiceUpdatedV2",
            Self::V3 => "engine_forkchoiceUpdatedV3",
        }
    }

    /// JSON-RPC method of the oracle-only build call exposed by the patched
    /// re-execution client image.
    pub fn build_payload_method(self) -> &'static str {
        match self {
            Self::V1 => "engine_buildPayloadV1",
            Self::V2 => "engine_buildPayloadV2",
            Self::V3 => "engine_buildPayloadV3",
        }
    }
}

/// One causally-ordered unit of the replay stream: an execution payload
/// paired with the forkchoice update that canonicalizes it.
///
/// Records are created by the source adapter or the compression engine and
/// never mutated afterwards. `sequence` is the position inside one stream
/// file, starting at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub sequence: u64,
    pub payload: ExecutionPayload,
    /// Versioned hashes of any blob transactions in the payload. Only
    /// meaningful for V3 payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blob_versioned_hashes: Vec<B256>,
    /// Parent beacon block root, required by the V3 submission call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_beacon_block_root: Option<B256>,
    pub forkchoice: ForkchoiceState,
}

impl PayloadRecord {
    /// Pairs a payload with the forkchoice update declaring it the new
    /// head. Safe and finalized hashes stay zero: the benchmark chain never
    /// finalizes, which keeps clients from pruning replayed history.
    pub fn new(
        sequence: u64,
        payload: ExecutionPayload,
        blob_versioned_hashes: Vec<B256>,
        parent_beacon_block_root: Option<B256>,
    ) -> Self {
        let forkchoice = ForkchoiceState {
            head_block_hash: payload.block_hash(),
            safe_block_hash: B256::ZERO,
            finalized_block_hash: B256::ZERO,
        };
        Self {
            sequence,
            payload,
            blob_versioned_hashes,
            parent_beacon_block_root,
            forkchoice,
        }
    }

    fn v1(&self) -> &ExecutionPayloadV1 {
        match &self.payload {
            ExecutionPayload::V1(p) => p,
            ExecutionPayload::V2(p) => &p.payload_inner,
            ExecutionPayload::V3(p) => &p.payload_inner.payload_inner,
        }
    }

    pub fn block_hash(&self) -> B256 {
        self.v1().block_hash
    }

    pub fn parent_hash(&self) -> B256 {
        self.v1().parent_hash
    }

    pub fn block_number(&self) -> u64 {
        self.v1().block_number
    }

    pub fn gas_used(&self) -> u64 {
        self.v1().gas_used
    }

    pub fn gas_limit(&self) -> u64 {
        self.v1().gas_limit
    }

    pub fn timestamp(&self) -> u64 {
        self.v1().timestamp
    }

    pub fn transactions(&self) -> &[Bytes] {
        &self.v1().transactions
    }

    pub fn transaction_count(&self) -> usize {
        self.v1().transactions.len()
    }

    /// The engine API version this record must be submitted with.
    pub fn version(&self) -> EngineVersion {
        match &self.payload {
            ExecutionPayload::V1(_) => EngineVersion::V1,
            ExecutionPayload::V2(_) => EngineVersion::V2,
            ExecutionPayload::V3(_) => EngineVersion::V3,
        }
    }

    /// Whether this record directly extends `prev`: contiguous sequence,
    /// contiguous block number, and a matching parent hash.
    pub fn follows(&self, prev: &Self) -> bool {
        self.sequence == prev.sequence + 1
            && self.block_number() == prev.block_number() + 1
            && self.parent_hash() == prev.block_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{
        Address,
        Bloom,
        U256,
    };

    fn payload(number: u64, parent: B256, hash: B256) -> ExecutionPayload {
        ExecutionPayload::V1(ExecutionPayloadV1 {
            parent_hash: parent,
            fee_recipient: Address::ZERO,
            state_root: B256::ZERO,
            receipts_root: B256::ZERO,
            logs_bloom: Bloom::ZERO,
            prev_randao: B256::ZERO,
            block_number: number,
            gas_limit: 30_000_000,
            gas_used: 0,
            timestamp: number * 12,
            extra_data: Bytes::new(),
            base_fee_per_gas: U256::from(7u64),
            block_hash: hash,
            transactions: vec![],
        })
    }

    #[test]
    fn forkchoice_references_own_head() {
        let hash = B256::repeat_byte(0xaa);
        let record = PayloadRecord::new(0, payload(1, B256::ZERO, hash), vec![], None);
        assert_eq!(record.forkchoice.head_block_hash, hash);
        assert_eq!(record.forkchoice.safe_block_hash, B256::ZERO);
        assert_eq!(record.forkchoice.finalized_block_hash, B256::ZERO);
    }

    #[test]
    fn follows_requires_chain_and_sequence() {
        let a = PayloadRecord::new(0, payload(1, B256::ZERO, B256::repeat_byte(1)), vec![], None);
        let b = PayloadRecord::new(
            1,
            payload(2, B256::repeat_byte(1), B256::repeat_byte(2)),
            vec![],
            None,
        );
        assert!(b.follows(&a));

        let gap = PayloadRecord::new(
            2,
            payload(4, B256::repeat_byte(1), B256::repeat_byte(3)),
            vec![],
            None,
        );
        assert!(!gap.follows(&b));

        let wrong_parent = PayloadRecord::new(
            2,
            payload(3, B256::repeat_byte(9), B256::repeat_byte(3)),
            vec![],
            None,
        );
        assert!(!wrong_parent.follows(&b));
    }

    #[test]
    fn version_follows_payload_variant() {
        let record = PayloadRecord::new(0, payload(1, B256::ZERO, B256::repeat_byte(1)), vec![], None);
        assert_eq!(record.version(), EngineVersion::V1);
        assert_eq!(record.version().new_payload_method(), "engine_newPayloadV1");
        assert_eq!(
            record.version().forkchoice_method(),
            "engine_forkchoiceUpdatedV1"
        );
    }
}
