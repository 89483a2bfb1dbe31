use chrono::{DateTime, Utc};
use tracing::{error, info};

use doubleteam::config::Config;
use doubleteam::replay::replay;
use doubleteam::streaming::Consumer;
use doubleteam::wiring;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Replay stored batches through a fresh chain. Batches that fail again land
/// back in overflow under newer keys, past the cutoff.
pub async fn run(config: Config, until: Option<DateTime<Utc>>) -> Result<(), AnyError> {
    let until = until.unwrap_or_else(Utc::now);
    let pipeline = wiring::build(&config)?;
    let consumer = wiring::overflow_consumer(&config.overflow, pipeline.store.clone());

    let result = replay(&consumer, &pipeline.app, pipeline.primary.as_ref(), until).await;

    if let Err(e) = pipeline.app.close().await {
        error!(error = %e, "Pipeline closed with errors");
    }
    consumer.close().await?;

    let stats = result?;
    info!(
        batches = stats.batches,
        messages = stats.messages,
        errors = stats.errors,
        stopped_early = stats.stopped_early,
        lost = pipeline.app.lost(),
        "Restore finished"
    );
    Ok(())
}
