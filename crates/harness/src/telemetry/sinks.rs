//! Metric sinks and the fan-out consumer task.
//!
//! Every sample is delivered to every sink at-least-once. A sink outage is
//! retried with backoff and logged; it never reaches back into the
//! submission path, which is decoupled through the bounded queue.

use crate::{
    retry::{
        BackoffPolicy,
        with_backoff,
    },
    telemetry::{
        MetricSample,
        SampleQueue,
    },
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    fs::{
        File,
        OpenOptions,
    },
    io::{
        BufWriter,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tracing::{
    debug,
    error,
    info,
};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("push to {endpoint} failed: {source}")]
    Push {
        endpoint: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("remote sink {endpoint} answered http status {status}")]
    RemoteStatus { endpoint: Url, status: u16 },
}

/// A delivery target for metric samples. Push-model: `push(sample)` returns
/// ack or error.
#[async_trait]
pub trait MetricSink: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, sample: &MetricSample) -> Result<(), SinkError>;

    /// Flush any buffered deliveries. Called when the fan-out drains.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Durable local log: one JSON sample per line. Always configured — the
/// run summarizer reads it back.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                SinkError::Io {
                    path: path.clone(),
                    source: e,
                }
            })?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetricSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn push(&self, sample: &MetricSample) -> Result<(), SinkError> {
        let line = serde_json::to_string(sample)?;
        let mut writer = self.writer.lock();
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(|e| {
                SinkError::Io {
                    path: self.path.clone(),
                    source: e,
                }
            })
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().flush().map_err(|e| {
            SinkError::Io {
                path: self.path.clone(),
                source: e,
            }
        })
    }
}

/// Remote push sink: JSON POST per sample, basic auth optional.
pub struct HttpPushSink {
    client: reqwest::Client,
    endpoint: Url,
    basic_auth: Option<(String, String)>,
}

impl HttpPushSink {
    pub fn new(endpoint: Url, basic_auth: Option<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            basic_auth,
        }
    }
}

#[async_trait]
impl MetricSink for HttpPushSink {
    fn name(&self) -> &str {
        "http-push"
    }

    async fn push(&self, sample: &MetricSample) -> Result<(), SinkError> {
        let mut request = self.client.post(self.endpoint.clone()).json(sample);
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await.map_err(|e| {
            SinkError::Push {
                endpoint: self.endpoint.clone(),
                source: e,
            }
        })?;
        if !response.status().is_success() {
            return Err(SinkError::RemoteStatus {
                endpoint: self.endpoint.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Consumer task body: drains the queue and delivers each sample to every
/// sink until the queue is closed and empty. Returns the number of samples
/// delivered.
pub async fn run_fanout(
    queue: Arc<SampleQueue>,
    sinks: Vec<Box<dyn MetricSink>>,
    retry: BackoffPolicy,
) -> u64 {
    let mut delivered = 0u64;
    while let Some(batch) = queue.recv_batch().await {
        for sample in &batch {
            for sink in &sinks {
                let outcome =
                    with_backoff(retry, sink.name(), || async { sink.push(sample).await }).await;
                if let Err(err) = outcome {
                    // At-least-once is bounded by the retry budget; a sink
                    // that stays down loses this delivery, never the run.
                    error!(sink = sink.name(), %err, "sample delivery failed");
                }
            }
            delivered += 1;
        }
        debug!(batch = batch.len(), delivered, "fanned out sample batch");
    }
    for sink in &sinks {
        if let Err(err) = sink.flush().await {
            error!(sink = sink.name(), %err, "sink flush failed");
        }
    }
    info!(delivered, dropped = queue.dropped(), "telemetry fan-out drained");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{
        AtomicU64,
        Ordering,
    };

    #[derive(Default)]
    struct Counters {
        delivered: AtomicU64,
        failures_left: AtomicU64,
    }

    struct CountingSink(Arc<Counters>);

    #[async_trait]
    impl MetricSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn push(&self, _sample: &MetricSample) -> Result<(), SinkError> {
            if self
                .0
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::RemoteStatus {
                    endpoint: Url::parse("http://sink.invalid").unwrap(),
                    status: 503,
                });
            }
            self.0.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fanout_retries_transient_sink_outage() {
        let queue = SampleQueue::new(8);
        queue.push(MetricSample::new("a", 1.0));
        queue.push(MetricSample::new("b", 2.0));
        queue.close();

        let counters = Arc::new(Counters {
            delivered: AtomicU64::new(0),
            failures_left: AtomicU64::new(1),
        });
        let sink = Box::new(CountingSink(Arc::clone(&counters)));
        let delivered = run_fanout(queue, vec![sink], BackoffPolicy::default()).await;

        assert_eq!(delivered, 2);
        // Both samples reached the sink despite the initial failure.
        assert_eq!(counters.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.jsonl");
        let sink = JsonlSink::create(&path).unwrap();
        sink.push(&MetricSample::new("x", 1.0)).await.unwrap();
        sink.push(&MetricSample::new("y", 2.0).with_index(4)).await.unwrap();
        sink.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: MetricSample = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.payload_index, Some(4));
    }
}
