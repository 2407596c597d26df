//! Pure window-planning and validity-trimming logic.
//!
//! The planner owns every drop decision the engine can make without the
//! oracle: blob policy, the per-output gas ceiling, same-sender cascades,
//! and the window overflow cap. Oracle rejections are reported back into
//! it so later transactions from the same sender cascade too.

use alloy_primitives::{
    Address,
    B256,
    Bytes,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::{
    HashSet,
    VecDeque,
};

/// Why a transaction was excluded from the compressed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The oracle excluded it during replay (stale nonce, insufficient
    /// balance, gas violation — the oracle does not say which).
    RejectedByOracle,
    /// An earlier transaction from the same sender was dropped in this
    /// window; nonce continuity cannot be faked.
    NonceContinuity,
    /// Declared gas limit alone exceeds the output ceiling.
    GasAboveCeiling,
    /// The window already produced its maximum number of output payloads.
    /// Drops stay inside the window, they never spill into the next one.
    WindowOverflow,
    /// Blob-carrying transaction excluded by policy.
    BlobExcluded,
}

/// Ledger entry for one dropped transaction, keyed by source identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedTx {
    pub hash: B256,
    pub sender: Address,
    pub source_block: u64,
    pub reason: DropReason,
}

/// One source transaction with everything the planner needs to know.
#[derive(Debug, Clone)]
pub struct SourceTx {
    pub raw: Bytes,
    pub hash: B256,
    pub sender: Address,
    pub gas_limit: u64,
    pub is_blob: bool,
    pub source_block: u64,
}

impl SourceTx {
    fn dropped(&self, reason: DropReason) -> DroppedTx {
        DroppedTx {
            hash: self.hash,
            sender: self.sender,
            source_block: self.source_block,
            reason,
        }
    }
}

/// Mutable planning state for one compression window.
#[derive(Debug)]
pub struct WindowPlan {
    remaining: VecDeque<SourceTx>,
    dropped_senders: HashSet<Address>,
    dropped: Vec<DroppedTx>,
    ceiling: u64,
}

impl WindowPlan {
    /// Seeds the plan with the window's concatenated transactions in their
    /// original relative order, applying the blob policy up front.
    pub fn new(transactions: Vec<SourceTx>, ceiling: u64, include_blobs: bool) -> Self {
        let mut dropped = Vec::new();
        let remaining = transactions
            .into_iter()
            .filter(|tx| {
                if tx.is_blob && !include_blobs {
                    dropped.push(tx.dropped(DropReason::BlobExcluded));
                    false
                } else {
                    true
                }
            })
            .collect();
        Self {
            remaining,
            dropped_senders: HashSet::new(),
            dropped,
            ceiling,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Greedy prefix of the remaining transactions whose declared gas
    /// limits sum to at most the ceiling. Transactions from already-dropped
    /// senders cascade out here; a single transaction that cannot fit any
    /// output is dropped with a cascade of its own.
    ///
    /// An empty return means the window is exhausted.
    pub fn next_batch(&mut self) -> Vec<SourceTx> {
        let mut batch = Vec::new();
        let mut gas = 0u64;
        while let Some(tx) = self.remaining.pop_front() {
            if self.dropped_senders.contains(&tx.sender) {
                self.dropped.push(tx.dropped(DropReason::NonceContinuity));
                continue;
            }
            if tx.gas_limit > self.ceiling {
                self.dropped_senders.insert(tx.sender);
                self.dropped.push(tx.dropped(DropReason::GasAboveCeiling));
                continue;
            }
            if gas.saturating_add(tx.gas_limit) > self.ceiling {
                self.remaining.push_front(tx);
                break;
            }
            gas += tx.gas_limit;
            batch.push(tx);
        }
        batch
    }

    /// Records an oracle rejection. Later transactions from the same
    /// sender in this window will cascade on the next [`Self::next_batch`].
    pub fn reject(&mut self, tx: &SourceTx) {
        self.dropped_senders.insert(tx.sender);
        self.dropped.push(tx.dropped(DropReason::RejectedByOracle));
    }

    /// Drops everything still pending because the window hit its output
    /// cap.
    pub fn drain_overflow(&mut self) {
        while let Some(tx) = self.remaining.pop_front() {
            self.dropped.push(tx.dropped(DropReason::WindowOverflow));
        }
    }

    /// Consumes the plan, yielding the drop ledger for this window.
    pub fn into_dropped(self) -> Vec<DroppedTx> {
        self.dropped
    }
}
