//! Fallback chain orchestrator
//!
//! An [`Application`] owns an ordered chain of producers joined by bounded
//! queues `Q0..Qn`. Producer `i` reads `Q(i)` and everything it fails to
//! deliver is pushed onto `Q(i+1)` for the next producer. Whatever reaches the
//! last queue is counted as lost and turns the application unhealthy for good.
//!
//! ```text
//! send -> Q0 -> primary -> Q1 -> overflow -> Q2 -> lost
//!                   |  ^             |  ^
//!                errors|          errors|
//!                   +--+             +--+
//! ```

mod stage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::observability::{Metrics, MetricsSnapshot};
use crate::streaming::types::lock;
use crate::streaming::{Message, Producer};

pub const DEFAULT_TELEMETRY_INTERVAL: Duration = Duration::from_secs(10);

const TERMINAL_QUEUE: &str = "terminal";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("at least one producer is required")]
    EmptyChain,

    #[error("queue size must be greater than zero")]
    InvalidQueueSize,

    #[error("telemetry interval must be greater than zero")]
    InvalidTelemetryInterval,

    #[error("producer {0} does not accept input")]
    InputClosed(String),

    #[error("error stream of producer {0} was already taken")]
    ErrorsAlreadyTaken(String),

    #[error("application is closed")]
    Closed,

    #[error("{failed} of {total} producers failed to close")]
    Close { failed: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HealthError {
    #[error("producer {0} is unhealthy")]
    ProducerUnhealthy(String),

    #[error("{0} message(s) could not be delivered by any producer")]
    MessagesLost(u64),
}

/// Background tasks, consumed by `close`
struct Stages {
    forwarders: Vec<JoinHandle<()>>,
    absorbers: Vec<JoinHandle<()>>,
    sink: JoinHandle<()>,
    telemetry: JoinHandle<()>,
}

pub struct Application {
    entry: RwLock<Option<mpsc::Sender<Message>>>,
    producers: Vec<Arc<dyn Producer>>,
    stages: Mutex<Option<Stages>>,
    lost: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
}

impl Application {
    /// Wire `producers` into a fallback chain, first producer first
    ///
    /// Must be called within a Tokio runtime. Takes each producer's error
    /// stream.
    pub fn new(producers: Vec<Arc<dyn Producer>>, queue_size: usize) -> Result<Self> {
        Self::with_telemetry_interval(producers, queue_size, DEFAULT_TELEMETRY_INTERVAL)
    }

    pub fn with_telemetry_interval(
        producers: Vec<Arc<dyn Producer>>,
        queue_size: usize,
        telemetry_interval: Duration,
    ) -> Result<Self> {
        if producers.is_empty() {
            return Err(PipelineError::EmptyChain);
        }
        if queue_size == 0 {
            return Err(PipelineError::InvalidQueueSize);
        }
        if telemetry_interval.is_zero() {
            return Err(PipelineError::InvalidTelemetryInterval);
        }

        // Check the whole chain before taking any error stream
        let mut inputs = Vec::with_capacity(producers.len());
        for producer in &producers {
            let input = producer
                .input()
                .ok_or_else(|| PipelineError::InputClosed(producer.name().to_string()))?;
            if !producer.has_errors() {
                return Err(PipelineError::ErrorsAlreadyTaken(producer.name().to_string()));
            }
            inputs.push(input);
        }

        let mut ends = Vec::with_capacity(producers.len());
        for (producer, input) in producers.iter().zip(inputs) {
            let errors = producer
                .take_errors()
                .ok_or_else(|| PipelineError::ErrorsAlreadyTaken(producer.name().to_string()))?;
            ends.push((input, errors));
        }

        let metrics = Arc::new(Metrics::new(
            producers
                .iter()
                .map(|p| p.name().to_string())
                .chain([TERMINAL_QUEUE.to_string()]),
        ));
        let lost = Arc::new(AtomicU64::new(0));

        let (entry, mut queue) = mpsc::channel(queue_size);
        let mut weak_queues = vec![entry.downgrade()];
        let mut forwarders = Vec::with_capacity(producers.len());
        let mut absorbers = Vec::with_capacity(producers.len());

        for (index, (producer, (input, errors))) in producers.iter().zip(ends).enumerate() {
            let (next, next_queue) = mpsc::channel(queue_size);
            weak_queues.push(next.downgrade());
            let name = producer.name().to_string();

            forwarders.push(tokio::spawn(stage::forward(
                index,
                name.clone(),
                queue,
                input,
                next.clone(),
                Arc::clone(&metrics),
            )));
            absorbers.push(tokio::spawn(stage::absorb(
                index,
                name,
                errors,
                next,
                Arc::clone(&metrics),
            )));

            queue = next_queue;
        }

        let sink = tokio::spawn(stage::black_hole(queue, Arc::clone(&lost), Arc::clone(&metrics)));
        let telemetry = tokio::spawn(stage::sample_queues(
            weak_queues,
            telemetry_interval,
            Arc::clone(&metrics),
        ));

        info!(
            chain = ?producers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            queue_size,
            "Pipeline started"
        );

        Ok(Self {
            entry: RwLock::new(Some(entry)),
            producers,
            stages: Mutex::new(Some(Stages {
                forwarders,
                absorbers,
                sink,
                telemetry,
            })),
            lost,
            metrics,
        })
    }

    /// Enqueue a message, waiting while the first queue is full
    pub async fn send(
        &self,
        topic: impl Into<String>,
        key: impl Into<bytes::Bytes>,
        data: impl Into<bytes::Bytes>,
    ) -> Result<()> {
        self.send_message(Message::new(topic, key, data)).await
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        // Clone out so a full queue does not hold up `close`
        let entry = self.entry.read().await.clone().ok_or(PipelineError::Closed)?;

        entry.send(message).await.map_err(|_| PipelineError::Closed)?;
        self.metrics.message_sent();
        Ok(())
    }

    /// Drain every stage in order and close each producer
    ///
    /// Every producer is closed even when an earlier one fails. Messages
    /// still queued at that point fall through to later stages.
    pub async fn close(&self) -> Result<()> {
        let stages = lock(&self.stages).take().ok_or(PipelineError::Closed)?;
        drop(self.entry.write().await.take());
        stages.telemetry.abort();

        let total = self.producers.len();
        let mut failed = 0;

        let stages_iter = self
            .producers
            .iter()
            .zip(stages.forwarders)
            .zip(stages.absorbers);

        for ((producer, forwarder), absorber) in stages_iter {
            if let Err(e) = forwarder.await {
                error!(producer = producer.name(), error = %e, "Forwarder task failed");
            }

            if let Err(e) = producer.close().await {
                failed += 1;
                error!(producer = producer.name(), error = %e, "Failed to close producer");
            }

            if let Err(e) = absorber.await {
                error!(producer = producer.name(), error = %e, "Error absorber task failed");
            }
        }

        if let Err(e) = stages.sink.await {
            error!(error = %e, "Terminal sink task failed");
        }

        let lost = self.lost();
        if lost > 0 {
            warn!(lost, "Pipeline closed with lost messages");
        }
        info!(failed, total, "Pipeline closed");

        if failed > 0 {
            return Err(PipelineError::Close { failed, total });
        }
        Ok(())
    }

    /// Unhealthy while any producer is, and permanently after any loss
    pub fn is_healthy(&self) -> std::result::Result<(), HealthError> {
        if let Some(producer) = self.producers.iter().find(|p| !p.is_healthy()) {
            return Err(HealthError::ProducerUnhealthy(producer.name().to_string()));
        }

        match self.lost() {
            0 => Ok(()),
            lost => Err(HealthError::MessagesLost(lost)),
        }
    }

    /// `(name, healthy)` for each producer in chain order
    pub fn producer_health(&self) -> Vec<(String, bool)> {
        self.producers
            .iter()
            .map(|p| (p.name().to_string(), p.is_healthy()))
            .collect()
    }

    /// Messages no producer could deliver
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
