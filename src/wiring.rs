//! Build the production chain (HTTP primary, then blob-store overflow) from configuration

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, OverflowConfig};
use crate::pipeline::{Application, PipelineError};
use crate::storage::{BlobStore, StorageClient, StorageError};
use crate::streaming::{BatchConsumer, BatchProducer, HttpProducer, HttpProducerError, Producer};

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("Failed to open overflow storage: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to create primary producer: {0}")]
    Primary(#[from] HttpProducerError),

    #[error("Failed to start pipeline: {0}")]
    Pipeline(#[from] PipelineError),
}

/// A running chain plus the handles callers need besides the application
pub struct Pipeline {
    pub app: Arc<Application>,
    pub primary: Arc<HttpProducer>,
    pub store: Arc<dyn BlobStore>,
}

pub fn overflow_store(config: &OverflowConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    Ok(Arc::new(StorageClient::from_config(config)?))
}

/// Start `primary -> overflow` as configured. Must be called within a Tokio runtime.
pub fn build(config: &Config) -> Result<Pipeline, WiringError> {
    let store = overflow_store(&config.overflow)?;
    let primary = Arc::new(HttpProducer::new(config.primary.http_config())?);
    let overflow = Arc::new(BatchProducer::new(
        Arc::clone(&store),
        config.overflow.batch_config(),
    ));

    let producers = vec![primary.clone() as Arc<dyn Producer>, overflow as Arc<dyn Producer>];
    let app = Application::with_telemetry_interval(
        producers,
        config.server.queue_size,
        config.telemetry.interval.into(),
    )?;

    info!(
        primary = %config.primary.endpoint,
        overflow = ?config.overflow.provider,
        "Pipeline wired"
    );

    Ok(Pipeline {
        app: Arc::new(app),
        primary,
        store,
    })
}

/// Reader over the batches the overflow stage writes
pub fn overflow_consumer(config: &OverflowConfig, store: Arc<dyn BlobStore>) -> BatchConsumer {
    BatchConsumer::new(store, config.prefix.clone())
}
