//! Tasks wiring one queue of the chain to the next

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendError};
use tracing::{debug, error, warn};

use crate::observability::Metrics;
use crate::streaming::{DeliveryError, Message};

/// Move messages from `queue` into a producer's input
///
/// If the producer stops accepting input while messages are still queued, the
/// rest goes straight to the next queue.
pub(super) async fn forward(
    stage: usize,
    name: String,
    mut queue: mpsc::Receiver<Message>,
    input: mpsc::Sender<Message>,
    next: mpsc::Sender<Message>,
    metrics: Arc<Metrics>,
) {
    let mut input = Some(input);

    while let Some(message) = queue.recv().await {
        let rejected = match &input {
            Some(tx) => match tx.send(message).await {
                Ok(()) => {
                    metrics.message_delivered(stage);
                    continue;
                }
                Err(SendError(message)) => {
                    warn!(producer = %name, "Producer input closed, rerouting to next stage");
                    input = None;
                    message
                }
            },
            None => message,
        };

        metrics.messages_failed(stage, 1);
        if next.send(rejected).await.is_err() {
            error!(producer = %name, "Next stage closed, message dropped");
        }
    }

    debug!(producer = %name, "Forwarder drained");
}

/// Re-enqueue everything a producer failed to deliver onto the next queue
pub(super) async fn absorb(
    stage: usize,
    name: String,
    mut errors: mpsc::Receiver<DeliveryError>,
    next: mpsc::Sender<Message>,
    metrics: Arc<Metrics>,
) {
    while let Some(failure) = errors.recv().await {
        let count = failure.messages.len();
        warn!(producer = %name, count, error = %failure.cause, "Delivery failed, falling back");
        metrics.messages_failed(stage, count as u64);

        for message in failure.messages {
            if next.send(message).await.is_err() {
                error!(producer = %name, "Next stage closed, message dropped");
            }
        }
    }

    debug!(producer = %name, "Error stream closed");
}

/// Count and discard whatever fell through every stage
pub(super) async fn black_hole(
    mut queue: mpsc::Receiver<Message>,
    lost: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
) {
    while let Some(message) = queue.recv().await {
        let total = lost.fetch_add(1, Ordering::AcqRel) + 1;
        metrics.message_lost();
        error!(topic = message.topic(), total, "Message lost, every stage failed");
    }
}

/// Periodically record queue depth
///
/// Holds weak handles only, so it never keeps a queue open.
pub(super) async fn sample_queues(
    queues: Vec<mpsc::WeakSender<Message>>,
    period: Duration,
    metrics: Arc<Metrics>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        for (index, weak) in queues.iter().enumerate() {
            if let Some(queue) = weak.upgrade() {
                let capacity = queue.max_capacity();
                metrics.record_queue(index, capacity - queue.capacity(), capacity);
            }
        }
    }
}
