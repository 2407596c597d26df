//! Harness-internal process metrics, committed through the `metrics`
//! facade.
//!
//! Guard structs accumulate values during one unit of work and commit when
//! dropped, so early returns and error paths still record.

use metrics::{
    counter,
    gauge,
    histogram,
};
use std::time::Duration;

/// Per-payload submission metrics.
///
/// Will commit metrics when dropped.
#[derive(Debug, Default)]
pub struct PayloadMetrics {
    /// Block number the payload carried
    pub block_number: u64,
    /// Gas the client reported processing
    pub gas_used: u64,
    /// Transactions in the payload
    pub transaction_count: u64,
    /// Latency of the payload-submission call
    pub new_payload_duration: Duration,
    /// Latency of the paired forkchoice call
    pub fcu_duration: Duration,
}

impl PayloadMetrics {
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            ..Default::default()
        }
    }

    /// Commits the per-payload metrics
    pub fn commit(&self) {
        counter!("payloads_submitted_total").increment(1);
        counter!("payload_gas_total").increment(self.gas_used);
        histogram!("new_payload_duration_seconds").record(self.new_payload_duration);
        histogram!("forkchoice_duration_seconds").record(self.fcu_duration);
        histogram!("transactions_per_payload").record(self.transaction_count as f64);
        gauge!("current_payload_height").set(self.block_number as f64);
    }
}

impl Drop for PayloadMetrics {
    fn drop(&mut self) {
        self.commit();
    }
}

/// Telemetry pipeline health, committed when the fan-out drains.
///
/// Will commit metrics when dropped.
#[derive(Debug, Default)]
pub struct TelemetryMetrics {
    /// Samples delivered to every sink
    pub samples_delivered: u64,
    /// Samples discarded by the bounded queue
    pub samples_dropped: u64,
}

impl TelemetryMetrics {
    /// Commits the pipeline metrics
    pub fn commit(&self) {
        counter!("telemetry_samples_delivered_total").increment(self.samples_delivered);
        counter!("telemetry_samples_dropped_total").increment(self.samples_dropped);
    }
}

impl Drop for TelemetryMetrics {
    fn drop(&mut self) {
        self.commit();
    }
}
