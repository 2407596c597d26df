//! Benchmark output artifacts, either for logging or for serialization to
//! files.

use csv::Writer;
use serde::{
    Serialize,
    ser::SerializeStruct,
};
use std::{
    path::Path,
    time::Duration,
};
use tracing::info;

/// One gigagas, the unit client throughput is quoted in.
pub const GIGAGAS: u64 = 1_000_000_000;

/// Suffix for the per-payload latency csv file.
pub const COMBINED_OUTPUT_SUFFIX: &str = "combined_latency.csv";

/// Suffix for the cumulative gas csv file.
pub const GAS_OUTPUT_SUFFIX: &str = "total_gas.csv";

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a single payload-submission call.
#[derive(Debug, Clone)]
pub struct NewPayloadResult {
    pub gas_used: u64,
    pub latency: Duration,
}

impl NewPayloadResult {
    pub fn gas_per_second(&self) -> f64 {
        self.gas_used as f64 / self.latency.as_secs_f64()
    }
}

impl std::fmt::Display for NewPayloadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed at {:.4} Ggas/s, used {} gas, latency {:?}",
            self.gas_per_second() / GIGAGAS as f64,
            self.gas_used,
            self.latency
        )
    }
}

/// Combined result of one payload submission and its paired forkchoice
/// update.
#[derive(Debug, Clone)]
pub struct CombinedResult {
    pub block_number: u64,
    pub gas_limit: u64,
    pub transaction_count: u64,
    pub new_payload_result: NewPayloadResult,
    pub fcu_latency: Duration,
    pub total_latency: Duration,
}

impl CombinedResult {
    pub fn combined_gas_per_second(&self) -> f64 {
        self.new_payload_result.gas_used as f64 / self.total_latency.as_secs_f64()
    }
}

impl std::fmt::Display for CombinedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block {} {}, combined {:.4} Ggas/s, fcu {:?}",
            self.block_number,
            self.new_payload_result,
            self.combined_gas_per_second() / GIGAGAS as f64,
            self.fcu_latency,
        )
    }
}

/// Durations serialize as microseconds, the csv writer cannot handle
/// [`Duration`] directly.
impl Serialize for CombinedResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        let mut state = serializer.serialize_struct("CombinedResult", 7)?;
        state.serialize_field("block_number", &self.block_number)?;
        state.serialize_field("gas_limit", &self.gas_limit)?;
        state.serialize_field("transaction_count", &self.transaction_count)?;
        state.serialize_field("gas_used", &self.new_payload_result.gas_used)?;
        state.serialize_field("new_payload_latency", &self.new_payload_result.latency.as_micros())?;
        state.serialize_field("fcu_latency", &self.fcu_latency.as_micros())?;
        state.serialize_field("total_latency", &self.total_latency.as_micros())?;
        state.end()
    }
}

/// One row of cumulative gas data over benchmark time.
#[derive(Debug, Clone)]
pub struct TotalGasRow {
    pub block_number: u64,
    pub transaction_count: u64,
    pub gas_used: u64,
    /// Time since the start of the benchmark.
    pub time: Duration,
}

impl Serialize for TotalGasRow {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        let mut state = serializer.serialize_struct("TotalGasRow", 4)?;
        state.serialize_field("block_number", &self.block_number)?;
        state.serialize_field("transaction_count", &self.transaction_count)?;
        state.serialize_field("gas_used", &self.gas_used)?;
        state.serialize_field("time", &self.time.as_micros())?;
        state.end()
    }
}

/// Aggregated gas throughput of a whole run.
#[derive(Debug, Clone)]
pub struct TotalGasOutput {
    pub total_gas_used: u64,
    pub total_duration: Duration,
    pub blocks_processed: u64,
}

impl TotalGasOutput {
    /// `None` for an empty run.
    pub fn new(rows: &[TotalGasRow]) -> Option<Self> {
        let total_duration = rows.last().map(|row| row.time)?;
        Some(Self {
            total_gas_used: rows.iter().map(|row| row.gas_used).sum(),
            total_duration,
            blocks_processed: rows.len() as u64,
        })
    }

    pub fn total_gigagas_per_second(&self) -> f64 {
        self.total_gas_used as f64 / self.total_duration.as_secs_f64() / GIGAGAS as f64
    }
}

/// Writes the per-payload latency and cumulative gas csv files into the
/// run's output directory.
pub fn write_benchmark_results(
    output_dir: &Path,
    gas_rows: &[TotalGasRow],
    combined: &[CombinedResult],
) -> Result<(), OutputError> {
    let path = output_dir.join(COMBINED_OUTPUT_SUFFIX);
    info!(path = %path.display(), "writing engine api latency output");
    let mut writer = Writer::from_path(&path)?;
    for result in combined {
        writer.serialize(result)?;
    }
    writer.flush()?;

    let path = output_dir.join(GAS_OUTPUT_SUFFIX);
    info!(path = %path.display(), "writing total gas output");
    let mut writer = Writer::from_path(&path)?;
    for row in gas_rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn total_gas_row_serializes_time_as_micros() {
        let row = TotalGasRow {
            block_number: 1,
            transaction_count: 10,
            gas_used: 1_000,
            time: Duration::from_secs(1),
        };

        let mut writer = Writer::from_writer(vec![]);
        writer.serialize(row).unwrap();
        let out = writer.into_inner().unwrap();
        let mut lines = out.as_slice().lines();

        assert_eq!(
            lines.next().unwrap().unwrap(),
            "block_number,transaction_count,gas_used,time"
        );
        assert_eq!(lines.next().unwrap().unwrap(), "1,10,1000,1000000");
    }

    #[test]
    fn total_gas_output_aggregates_rows() {
        let rows: Vec<TotalGasRow> = (1..=4)
            .map(|i| {
                TotalGasRow {
                    block_number: i,
                    transaction_count: 1,
                    gas_used: 500,
                    time: Duration::from_secs(i),
                }
            })
            .collect();
        let output = TotalGasOutput::new(&rows).unwrap();
        assert_eq!(output.total_gas_used, 2_000);
        assert_eq!(output.blocks_processed, 4);
        assert_eq!(output.total_duration, Duration::from_secs(4));

        assert!(TotalGasOutput::new(&[]).is_none());
    }
}
