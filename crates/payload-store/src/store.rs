//! Append-only record streams on disk.
//!
//! One JSON record per line, sequence numbers strictly increasing from
//! zero. A writer produces `<name>.partial` and only renames it to its
//! final name when the run completed, so a reader can never observe a
//! half-written stream. Finished files are immutable.

use crate::record::PayloadRecord;
use alloy_primitives::B256;
use std::{
    fs::{
        File,
        OpenOptions,
    },
    io::{
        BufRead,
        BufReader,
        BufWriter,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
};
use tracing::{
    debug,
    info,
};

/// Suffix appended to a stream that is still being written.
const PARTIAL_SUFFIX: &str = "partial";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record at {path}:{line}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("record out of order: got sequence {sequence}, expected {expected}")]
    OutOfOrder { sequence: u64, expected: u64 },
    #[error(
        "broken parent chain at sequence {sequence}: parent {parent} does not match previous hash {previous}"
    )]
    BrokenChain {
        sequence: u64,
        parent: B256,
        previous: B256,
    },
    #[error("refusing to overwrite existing record stream {0}")]
    AlreadyExists(PathBuf),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(PARTIAL_SUFFIX);
    PathBuf::from(os)
}

/// Append-only writer for one record stream.
///
/// Enforces the stream invariants at write time: contiguous sequence
/// numbers and, from the second record on, an unbroken parent-hash chain.
#[derive(Debug)]
pub struct StoreWriter {
    path: PathBuf,
    partial: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    last_hash: Option<B256>,
}

impl StoreWriter {
    /// Opens a fresh stream at `path`. Fails if the final file or an
    /// abandoned partial from a previous run already exists: streams are
    /// written once per run, never appended to across runs.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if path.exists() {
            return Err(StoreError::AlreadyExists(path));
        }
        let partial = partial_path(&path);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .map_err(|e| StoreError::io(&partial, e))?;
        debug!(path = %path.display(), "opened record stream for writing");
        Ok(Self {
            path,
            partial,
            writer: BufWriter::new(file),
            next_sequence: 0,
            last_hash: None,
        })
    }

    /// Number of records written so far.
    pub fn written(&self) -> u64 {
        self.next_sequence
    }

    /// Appends one record, validating stream invariants.
    pub fn append(&mut self, record: &PayloadRecord) -> Result<(), StoreError> {
        if record.sequence != self.next_sequence {
            return Err(StoreError::OutOfOrder {
                sequence: record.sequence,
                expected: self.next_sequence,
            });
        }
        if let Some(previous) = self.last_hash
            && record.parent_hash() != previous
        {
            return Err(StoreError::BrokenChain {
                sequence: record.sequence,
                parent: record.parent_hash(),
                previous,
            });
        }
        let line = serde_json::to_string(record).map_err(|e| {
            StoreError::Malformed {
                path: self.partial.clone(),
                line: self.next_sequence as usize,
                source: e,
            }
        })?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .map_err(|e| StoreError::io(&self.partial, e))?;
        self.next_sequence += 1;
        self.last_hash = Some(record.block_hash());
        Ok(())
    }

    /// Flushes, fsyncs, and atomically renames the partial file into its
    /// final name. Only after this returns is the stream visible to
    /// readers. Returns the final path and the record count.
    pub fn finish(mut self) -> Result<(PathBuf, u64), StoreError> {
        self.writer
            .flush()
            .map_err(|e| StoreError::io(&self.partial, e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| StoreError::io(&self.partial, e))?;
        std::fs::rename(&self.partial, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        info!(
            path = %self.path.display(),
            records = self.next_sequence,
            "finished record stream"
        );
        Ok((self.path, self.next_sequence))
    }
}

/// Streaming reader over a finished record stream.
///
/// Re-validates the invariants the writer enforced; a stream that fails
/// them was corrupted or truncated and is rejected rather than replayed.
#[derive(Debug)]
pub struct StoreReader {
    path: PathBuf,
    reader: BufReader<File>,
    line: usize,
    next_sequence: u64,
    last_hash: Option<B256>,
}

impl StoreReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            line: 0,
            next_sequence: 0,
            last_hash: None,
        })
    }

    /// Reads an entire stream into memory.
    pub fn read_all(path: impl Into<PathBuf>) -> Result<Vec<PayloadRecord>, StoreError> {
        let mut reader = Self::open(path)?;
        let mut records = Vec::new();
        while let Some(record) = reader.next_record()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Next record, or `None` at end of stream.
    pub fn next_record(&mut self) -> Result<Option<PayloadRecord>, StoreError> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| StoreError::io(&self.path, e))?;
            if read == 0 {
                return Ok(None);
            }
            self.line += 1;
            if !line.trim().is_empty() {
                break;
            }
        }

        let record: PayloadRecord =
            serde_json::from_str(line.trim_end()).map_err(|e| {
                StoreError::Malformed {
                    path: self.path.clone(),
                    line: self.line,
                    source: e,
                }
            })?;

        if record.sequence != self.next_sequence {
            return Err(StoreError::OutOfOrder {
                sequence: record.sequence,
                expected: self.next_sequence,
            });
        }
        if let Some(previous) = self.last_hash
            && record.parent_hash() != previous
        {
            return Err(StoreError::BrokenChain {
                sequence: record.sequence,
                parent: record.parent_hash(),
                previous,
            });
        }
        self.next_sequence += 1;
        self.last_hash = Some(record.block_hash());
        Ok(Some(record))
    }
}

impl Iterator for StoreReader {
    type Item = Result<PayloadRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PayloadRecord;
    use alloy_primitives::{
        Address,
        Bloom,
        Bytes,
        U256,
    };
    use alloy_rpc_types_engine::{
        ExecutionPayload,
        ExecutionPayloadV1,
    };
    use pretty_assertions::assert_eq;

    fn record(sequence: u64, number: u64, parent: B256, hash: B256) -> PayloadRecord {
        PayloadRecord::new(
            sequence,
            ExecutionPayload::V1(ExecutionPayloadV1 {
                parent_hash: parent,
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
                block_hash: hash,
                transactions: vec![],
            }),
            vec![],
            None,
        )
    }

    fn chain(len: u64) -> Vec<PayloadRecord> {
        (0..len)
            .map(|i| {
                let parent = if i == 0 {
                    B256::ZERO
                } else {
                    B256::repeat_byte(i as u8)
                };
                record(i, i + 1, parent, B256::repeat_byte(i as u8 + 1))
            })
            .collect()
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");

        let records = chain(5);
        let mut writer = StoreWriter::create(&path).unwrap();
        for r in &records {
            writer.append(r).unwrap();
        }
        let (final_path, count) = writer.finish().unwrap();
        assert_eq!(count, 5);
        assert_eq!(final_path, path);

        let read = StoreReader::read_all(&path).unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn partial_stream_is_invisible_until_finished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");

        let mut writer = StoreWriter::create(&path).unwrap();
        writer.append(&chain(1)[0]).unwrap();
        // Reader must not see the in-progress file under the final name.
        assert!(StoreReader::open(&path).is_err());
        writer.finish().unwrap();
        assert_eq!(StoreReader::read_all(&path).unwrap().len(), 1);
    }

    #[test]
    fn writer_rejects_sequence_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StoreWriter::create(dir.path().join("records.jsonl")).unwrap();
        let err = writer
            .append(&record(3, 1, B256::ZERO, B256::repeat_byte(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::OutOfOrder {
                sequence: 3,
                expected: 0
            }
        ));
    }

    #[test]
    fn writer_rejects_broken_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StoreWriter::create(dir.path().join("records.jsonl")).unwrap();
        writer
            .append(&record(0, 1, B256::ZERO, B256::repeat_byte(1)))
            .unwrap();
        let err = writer
            .append(&record(1, 2, B256::repeat_byte(9), B256::repeat_byte(2)))
            .unwrap_err();
        assert!(matches!(err, StoreError::BrokenChain { sequence: 1, .. }));
    }

    #[test]
    fn refuses_to_overwrite_finished_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        StoreWriter::create(&path).unwrap().finish().unwrap();
        assert!(matches!(
            StoreWriter::create(&path),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn identical_input_produces_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let records = chain(4);

        let mut bytes = Vec::new();
        for name in ["a.jsonl", "b.jsonl"] {
            let path = dir.path().join(name);
            let mut writer = StoreWriter::create(&path).unwrap();
            for r in &records {
                writer.append(r).unwrap();
            }
            writer.finish().unwrap();
            bytes.push(std::fs::read(&path).unwrap());
        }
        assert_eq!(bytes[0], bytes[1]);
    }
}
