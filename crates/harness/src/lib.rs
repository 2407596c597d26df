#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::similar_names)]

//! # `enginebench`
//!
//! Benchmarking harness for Ethereum execution clients. Chain history is
//! converted into an ordered payload/forkchoice record stream, optionally
//! compressed into fewer, denser blocks through a disposable re-execution
//! oracle, and replayed in strict causal order against a sandboxed client
//! under test while per-payload latency and process telemetry stream out
//! through a bounded fan-out.

pub mod args;
pub mod compress;
pub mod driver;
pub mod loadgen;
pub mod metrics;
pub mod output;
pub mod retry;
pub mod sandbox;
pub mod scenario;
pub mod source;
pub mod summary;
pub mod telemetry;

pub use scenario::{
    ScenarioOutcome,
    ScenarioState,
};
pub use telemetry::{
    MetricSample,
    SampleQueue,
};
