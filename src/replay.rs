//! Replay stored overflow batches back through a pipeline
//!
//! Batches are deleted only after every message in them has been handed to
//! the application, so a crash mid-replay repeats a batch instead of losing it.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::pipeline::{Application, PipelineError};
use crate::streaming::{Consumer, ConsumerError, Producer, StoredBatch};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Batches fully sent and committed
    pub batches: u64,
    pub messages: u64,
    /// Read and commit failures
    pub errors: u64,
    /// Replay ended before the consumer ran dry
    pub stopped_early: bool,
}

/// Drain everything `consumer` stored up to `until` into `app`
///
/// Stops after the current batch once the application or `primary` reports
/// unhealthy. The caller is responsible for closing `app`.
pub async fn replay(
    consumer: &dyn Consumer,
    app: &Application,
    primary: &dyn Producer,
    until: DateTime<Utc>,
) -> Result<ReplayStats> {
    let (mut batches, mut errors) = consumer.output(until);
    let mut stats = ReplayStats::default();

    info!(%until, "Starting replay");

    loop {
        tokio::select! {
            batch = batches.recv() => match batch {
                Some(batch) => {
                    replay_batch(consumer, app, batch, &mut stats).await?;

                    if let Err(reason) = healthy(app, primary) {
                        warn!(reason, "Stopping replay early");
                        stats.stopped_early = true;
                        break;
                    }
                }
                None => break,
            },
            Some(e) = errors.recv() => record_error(&mut stats, e),
        }
    }

    // Drop the reader so it stops listing, then collect what it already reported
    drop(batches);
    drain_errors(&mut errors, &mut stats);

    info!(
        batches = stats.batches,
        messages = stats.messages,
        errors = stats.errors,
        stopped_early = stats.stopped_early,
        "Replay finished"
    );
    Ok(stats)
}

async fn replay_batch(
    consumer: &dyn Consumer,
    app: &Application,
    batch: StoredBatch,
    stats: &mut ReplayStats,
) -> Result<()> {
    let count = batch.messages.len() as u64;

    for message in batch.messages {
        app.send_message(message).await?;
    }
    stats.messages += count;
    app.metrics().messages_consumed(count);

    match consumer.commit(&batch.key).await {
        Ok(()) => {
            stats.batches += 1;
            info!(key = %batch.key, count, "Batch replayed");
        }
        Err(e) => {
            stats.errors += 1;
            error!(key = %batch.key, error = %e, "Failed to delete replayed batch");
        }
    }
    Ok(())
}

fn healthy(app: &Application, primary: &dyn Producer) -> std::result::Result<(), String> {
    app.is_healthy().map_err(|e| e.to_string())?;
    if !primary.is_healthy() {
        return Err(format!("producer {} is unhealthy", primary.name()));
    }
    Ok(())
}

fn record_error(stats: &mut ReplayStats, e: ConsumerError) {
    stats.errors += 1;
    warn!(error = %e, "Failed to read stored batch");
}

fn drain_errors(errors: &mut mpsc::Receiver<ConsumerError>, stats: &mut ReplayStats) {
    while let Ok(e) = errors.try_recv() {
        record_error(stats, e);
    }
}
