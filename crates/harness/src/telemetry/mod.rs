//! # Telemetry fan-out
//!
//! Metric samples from the driver and the process supervisor are pushed
//! into a bounded drop-oldest queue and delivered to every configured sink
//! by an independent consumer task. The submission path never waits on a
//! sink: on saturation the oldest unflushed sample is discarded and a drop
//! counter increments.

pub mod sinks;

use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
    },
};
use tokio::sync::Notify;
use tracing::{
    debug,
    warn,
};

pub use sinks::{
    HttpPushSink,
    JsonlSink,
    MetricSink,
    SinkError,
    run_fanout,
};

/// Name of the sample the driver emits once a payload became canonical.
/// The failure diagnostics scan the durable log for it to recover the
/// last accepted payload hash.
pub const ACCEPTED_SAMPLE: &str = "payload_accepted";

/// One immutable measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_index: Option<u64>,
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            payload_index: None,
            name: name.into(),
            value,
            timestamp: Utc::now(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.payload_index = Some(index);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Bounded drop-oldest queue between the submission path and the fan-out
/// consumer.
///
/// `push` never blocks and never fails; correctness of the driver must not
/// depend on telemetry keeping up.
#[derive(Debug)]
pub struct SampleQueue {
    samples: Mutex<VecDeque<MetricSample>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "sample queue capacity must be non-zero");
        Arc::new(Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Enqueues a sample, discarding the oldest unflushed one on
    /// saturation.
    pub fn push(&self, sample: MetricSample) {
        {
            let mut samples = self.samples.lock();
            if samples.len() == self.capacity {
                samples.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "telemetry queue saturated, dropping oldest samples");
                }
            }
            samples.push_back(sample);
        }
        self.notify.notify_one();
    }

    /// Marks the producing side finished. The consumer drains what is left
    /// and then terminates.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        debug!("sample queue closed");
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Samples discarded due to saturation so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits for the next batch of samples. Returns `None` once the queue
    /// is closed and fully drained.
    pub async fn recv_batch(&self) -> Option<Vec<MetricSample>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut samples = self.samples.lock();
                if !samples.is_empty() {
                    return Some(samples.drain(..).collect());
                }
            }
            if self.closed.load(Ordering::Acquire) {
                // Lost race: a push may have landed between the drain and
                // the closed check.
                let mut samples = self.samples.lock();
                if samples.is_empty() {
                    return None;
                }
                return Some(samples.drain(..).collect());
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_drops_oldest_and_counts() {
        let queue = SampleQueue::new(2);
        queue.push(MetricSample::new("a", 1.0));
        queue.push(MetricSample::new("b", 2.0));
        queue.push(MetricSample::new("c", 3.0));

        assert_eq!(queue.dropped(), 1);
        let batch = futures::executor::block_on(queue.recv_batch()).unwrap();
        let names: Vec<_> = batch.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn consumer_terminates_after_close_and_drain() {
        let queue = SampleQueue::new(8);
        queue.push(MetricSample::new("a", 1.0));
        queue.close();

        assert_eq!(queue.recv_batch().await.unwrap().len(), 1);
        assert!(queue.recv_batch().await.is_none());
    }

    #[tokio::test]
    async fn recv_waits_for_new_samples() {
        let queue = SampleQueue::new(8);
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv_batch().await })
        };
        tokio::task::yield_now().await;
        queue.push(MetricSample::new("late", 1.0));
        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch[0].name, "late");
    }

    #[test]
    fn sample_builder_sets_fields() {
        let sample = MetricSample::new("new_payload_latency_us", 42.0)
            .with_index(7)
            .with_tag("client", "reth");
        assert_eq!(sample.payload_index, Some(7));
        assert_eq!(sample.tags["client"], "reth");
    }
}
