//! Observability (metrics, tracing)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A subscriber may already be installed (tests, embedding)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run `f` under a scoped `info` subscriber
///
/// Covers work done before the configured log level is known, such as loading
/// the configuration itself.
pub fn with_startup_logging<T>(f: impl FnOnce() -> T) -> T {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::with_default(subscriber, f)
}

/// Counters and gauges for one queue of the fallback chain
#[derive(Debug)]
struct QueueMetrics {
    name: String,
    delivered: AtomicU64,
    failed: AtomicU64,
    length: AtomicU64,
    capacity: AtomicU64,
}

/// Metrics handle for recording counters/gauges
///
/// Queue `i` feeds stage `i`; the last queue feeds the terminal sink.
#[derive(Debug)]
pub struct Metrics {
    queues: Vec<QueueMetrics>,
    sent: AtomicU64,
    lost: AtomicU64,
    consumed: AtomicU64,
}

impl Metrics {
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues
                .into_iter()
                .map(|name| QueueMetrics {
                    name: name.into(),
                    delivered: AtomicU64::new(0),
                    failed: AtomicU64::new(0),
                    length: AtomicU64::new(0),
                    capacity: AtomicU64::new(0),
                })
                .collect(),
            sent: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    pub fn message_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "sent", "Metric incremented");
    }

    /// A message was handed to the producer reading queue `queue`
    pub fn message_delivered(&self, queue: usize) {
        if let Some(q) = self.queues.get(queue) {
            q.delivered.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(counter = "delivered", queue = %q.name, "Metric incremented");
        }
    }

    /// `count` messages failed at the stage reading queue `queue`
    pub fn messages_failed(&self, queue: usize, count: u64) {
        if let Some(q) = self.queues.get(queue) {
            q.failed.fetch_add(count, Ordering::Relaxed);
            tracing::debug!(counter = "failed", queue = %q.name, count, "Metric incremented");
        }
    }

    pub fn message_lost(&self) {
        self.lost.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "lost", "Metric incremented");
    }

    /// Messages read back from the overflow store during replay
    pub fn messages_consumed(&self, count: u64) {
        self.consumed.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(counter = "consumed", count, "Metric incremented");
    }

    pub fn record_queue(&self, queue: usize, length: usize, capacity: usize) {
        if let Some(q) = self.queues.get(queue) {
            q.length.store(length as u64, Ordering::Relaxed);
            q.capacity.store(capacity as u64, Ordering::Relaxed);
            tracing::debug!(queue = %q.name, length, capacity, "Queue sampled");
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queues: self
                .queues
                .iter()
                .map(|q| QueueSnapshot {
                    name: q.name.clone(),
                    delivered: q.delivered.load(Ordering::Relaxed),
                    failed: q.failed.load(Ordering::Relaxed),
                    length: q.length.load(Ordering::Relaxed),
                    capacity: q.capacity.load(Ordering::Relaxed),
                })
                .collect(),
            sent: self.sent.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub delivered: u64,
    pub failed: u64,
    pub length: u64,
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queues: Vec<QueueSnapshot>,
    pub sent: u64,
    pub lost: u64,
    pub consumed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_logging_is_active_inside_closure() {
        let enabled = with_startup_logging(|| tracing::enabled!(tracing::Level::ERROR));
        assert!(enabled);
    }

    #[test]
    fn test_counters_per_queue() {
        let metrics = Metrics::new(["primary", "overflow", "terminal"]);

        metrics.message_sent();
        metrics.message_delivered(0);
        metrics.messages_failed(0, 3);
        metrics.message_delivered(1);
        metrics.record_queue(1, 4, 10);
        metrics.message_lost();
        // out of range indices are ignored
        metrics.message_delivered(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent, 1);
        assert_eq!(snapshot.lost, 1);
        assert_eq!(snapshot.queues[0].delivered, 1);
        assert_eq!(snapshot.queues[0].failed, 3);
        assert_eq!(snapshot.queues[1].length, 4);
        assert_eq!(snapshot.queues[1].capacity, 10);
        assert_eq!(snapshot.queues[2].name, "terminal");
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new(["primary"]);
        metrics.messages_consumed(2);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["consumed"], 2);
        assert_eq!(json["queues"][0]["name"], "primary");
    }
}
