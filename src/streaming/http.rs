//! Primary stream producer over HTTP
//!
//! Each message is POSTed as JSON to `{endpoint}/topics/{topic}`, the shape
//! REST front ends for log brokers accept. Up to `max_in_flight` publishes run
//! at once. Transient failures are retried with exponential backoff; a message
//! that still fails is reported to the circuit breaker and handed back on the
//! error stream so the pipeline can fall back.
//!
//! Messages that cannot be encoded never reach the backend and are not
//! reported to the breaker.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url, header};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::types::{BoxError, DeliveryError, Message, Producer, ProducerError, lock};
use crate::breaker::Breaker;

const NAME: &str = "primary";
const INPUT_CAPACITY: usize = 1;
const ERROR_CAPACITY: usize = 100;
/// Backoff doubles per attempt up to this many times
const MAX_BACKOFF_SHIFT: u32 = 6;

#[derive(Debug, Error)]
pub enum HttpProducerError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl PublishError {
    fn is_retryable(&self) -> bool {
        match self {
            PublishError::Encode(_) => false,
            PublishError::Request(e) => !e.is_builder() && !e.is_body() && !e.is_decode(),
            PublishError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
        }
    }
}

/// HTTP producer configuration
#[derive(Debug, Clone, bon::Builder)]
pub struct HttpConfig {
    #[builder(into)]
    pub endpoint: String,
    #[builder(default = Duration::from_secs(5))]
    pub connect_timeout: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub request_timeout: Duration,
    /// Retries after the first attempt
    #[builder(default = 5)]
    pub max_retries: u32,
    #[builder(default = Duration::from_millis(10))]
    pub retry_backoff: Duration,
    #[builder(default = 5)]
    pub breaker_threshold: u32,
    #[builder(default = Duration::from_secs(1))]
    pub breaker_timeout: Duration,
    /// Concurrent publishes
    #[builder(default = 64)]
    pub max_in_flight: usize,
}

/// Breaker-guarded producer for the low-latency primary stream
pub struct HttpProducer {
    breaker: Breaker,
    reachable: Arc<AtomicBool>,
    input: Mutex<Option<mpsc::Sender<Message>>>,
    errors: Mutex<Option<mpsc::Receiver<DeliveryError>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl HttpProducer {
    /// Build the client and start dispatching. Must be called within a Tokio runtime.
    pub fn new(config: HttpConfig) -> Result<Self, HttpProducerError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| HttpProducerError::InvalidEndpoint(format!("{}: {}", config.endpoint, e)))?;
        if endpoint.cannot_be_a_base() || !matches!(endpoint.scheme(), "http" | "https") {
            return Err(HttpProducerError::InvalidEndpoint(config.endpoint));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(concat!("doubleteam/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let breaker = Breaker::new(config.breaker_threshold, config.breaker_timeout);
        let reachable = Arc::new(AtomicBool::new(true));

        let publisher = Arc::new(Publisher {
            client,
            endpoint,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            reachable: Arc::clone(&reachable),
        });

        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CAPACITY);

        info!(
            endpoint = %publisher.endpoint,
            max_in_flight = config.max_in_flight,
            "Starting primary producer"
        );
        let dispatcher = tokio::spawn(dispatch_messages(
            publisher,
            breaker.clone(),
            input_rx,
            error_tx,
            config.max_in_flight.max(1),
        ));

        Ok(Self {
            breaker,
            reachable,
            input: Mutex::new(Some(input_tx)),
            errors: Mutex::new(Some(error_rx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }
}

#[async_trait]
impl Producer for HttpProducer {
    fn name(&self) -> &str {
        NAME
    }

    fn input(&self) -> Option<mpsc::Sender<Message>> {
        lock(&self.input).clone()
    }

    fn take_errors(&self) -> Option<mpsc::Receiver<DeliveryError>> {
        lock(&self.errors).take()
    }

    fn has_errors(&self) -> bool {
        lock(&self.errors).is_some()
    }

    async fn close(&self) -> Result<(), ProducerError> {
        let dispatcher = lock(&self.dispatcher)
            .take()
            .ok_or_else(|| ProducerError::AlreadyClosed(NAME.to_string()))?;

        drop(lock(&self.input).take());

        dispatcher.await.map_err(|source| ProducerError::Task {
            name: NAME.to_string(),
            source,
        })
    }

    /// False while the endpoint refuses connections
    fn is_healthy(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }
}

struct Publisher {
    client: Client,
    endpoint: Url,
    max_retries: u32,
    retry_backoff: Duration,
    reachable: Arc<AtomicBool>,
}

impl Publisher {
    fn topic_url(&self, topic: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("topics").push(topic);
        }
        url
    }

    /// Publish with retry
    ///
    /// Gives up early once the breaker opens.
    async fn publish(&self, topic: &str, body: Bytes, breaker: &Breaker) -> Result<(), PublishError> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.publish_once(topic, body.clone()).await {
                Ok(()) => {
                    if attempts > 1 {
                        debug!(topic, attempts, "Publish succeeded after retry");
                    }
                    return Ok(());
                }
                Err(e) if !e.is_retryable() || attempts > self.max_retries => return Err(e),
                Err(e) if breaker.is_open() => {
                    debug!(topic, attempts, error = %e, "Breaker open, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    debug!(topic, attempts, error = %e, "Publish failed, retrying");
                    let backoff = self.retry_backoff * 2u32.pow((attempts - 1).min(MAX_BACKOFF_SHIFT));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn publish_once(&self, topic: &str, body: Bytes) -> Result<(), PublishError> {
        let response = self
            .client
            .post(self.topic_url(topic))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .inspect_err(|e| {
                if e.is_connect() {
                    self.reachable.store(false, Ordering::Release);
                }
            })?;

        self.reachable.store(true, Ordering::Release);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

async fn dispatch_messages(
    publisher: Arc<Publisher>,
    breaker: Breaker,
    mut input: mpsc::Receiver<Message>,
    errors: mpsc::Sender<DeliveryError>,
    max_in_flight: usize,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut in_flight = JoinSet::new();

    while let Some(message) = input.recv().await {
        while let Some(result) = in_flight.try_join_next() {
            log_task_failure(result);
        }

        let body = match serde_json::to_vec(&message) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(topic = message.topic(), error = %e, "Message cannot be encoded");
                report(&errors, message, Box::new(PublishError::Encode(e))).await;
                continue;
            }
        };

        // Waits while `max_in_flight` publishes are running
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        in_flight.spawn(deliver(
            Arc::clone(&publisher),
            breaker.clone(),
            errors.clone(),
            message,
            body,
            permit,
        ));
    }

    while let Some(result) = in_flight.join_next().await {
        log_task_failure(result);
    }
    debug!("Primary input drained");
}

async fn deliver(
    publisher: Arc<Publisher>,
    breaker: Breaker,
    errors: mpsc::Sender<DeliveryError>,
    message: Message,
    body: Bytes,
    _permit: OwnedSemaphorePermit,
) {
    let outcome = breaker
        .run_async(|| publisher.publish(message.topic(), body, &breaker))
        .await;

    let cause: BoxError = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => {
            breaker.error();
            warn!(topic = message.topic(), error = %e, "Publish failed");
            Box::new(e)
        }
        // Rejections are not fed back into the breaker
        Err(open) => Box::new(open),
    };

    report(&errors, message, cause).await;
}

async fn report(errors: &mpsc::Sender<DeliveryError>, message: Message, cause: BoxError) {
    if errors.send(DeliveryError::new(vec![message], cause)).await.is_err() {
        error!("Error stream closed, failed message dropped");
    }
}

fn log_task_failure(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Publish task failed");
    }
}
