//! Deterministic chain fixtures.

use alloy_primitives::{
    Address,
    B256,
    Bloom,
    Bytes,
    U256,
};
use alloy_rpc_types_engine::{
    ExecutionPayload,
    ExecutionPayloadV1,
};
use payload_store::PayloadRecord;
use serde_json::{
    Value,
    json,
};

fn number_hash(number: u64) -> B256 {
    B256::from(U256::from(number))
}

/// A chain of `len` empty V1 records starting at block 1, hashes derived
/// from block numbers so re-generation is byte-identical.
pub fn chain_records(len: u64) -> Vec<PayloadRecord> {
    (0..len)
        .map(|sequence| {
            let number = sequence + 1;
            PayloadRecord::new(
                sequence,
                ExecutionPayload::V1(ExecutionPayloadV1 {
                    parent_hash: number_hash(number - 1),
                    fee_recipient: Address::ZERO,
                    state_root: B256::ZERO,
                    receipts_root: B256::ZERO,
                    logs_bloom: Bloom::ZERO,
                    prev_randao: B256::ZERO,
                    block_number: number,
                    gas_limit: 30_000_000,
                    gas_used: 21_000,
                    timestamp: number * 12,
                    extra_data: Bytes::new(),
                    base_fee_per_gas: U256::from(7u64),
                    block_hash: number_hash(number),
                    transactions: vec![],
                }),
                vec![],
                None,
            )
        })
        .collect()
}

/// A full RPC block object with every field the standard network block
/// type requires, chained by block number like [`chain_records`].
pub fn mock_block(number: u64) -> Value {
    json!({
        "hash": number_hash(number),
        "parentHash": number_hash(number.saturating_sub(1)),
        "sha3Uncles": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
        "miner": "0x0000000000000000000000000000000000000000",
        "stateRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
        "transactionsRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
        "receiptsRoot": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
        "logsBloom": format!("0x{:0512}", 0),
        "difficulty": "0x0",
        "number": format!("0x{number:x}"),
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x5208",
        "timestamp": format!("0x{:x}", number * 12),
        "extraData": "0x",
        "mixHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
        "nonce": "0x0000000000000000",
        "baseFeePerGas": "0x7",
        "totalDifficulty": "0x0",
        "size": "0x21c",
        "transactions": [],
        "uncles": []
    })
}
