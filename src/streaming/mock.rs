//! In-process producer for development and tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::{DeliveryError, Message, Producer, ProducerError, lock};

/// Producer that either keeps every message or hands every message back
pub struct MockProducer {
    name: String,
    accepted: Arc<Mutex<Vec<Message>>>,
    healthy: AtomicBool,
    fail_close: bool,
    input: Mutex<Option<mpsc::Sender<Message>>>,
    errors: Mutex<Option<mpsc::Receiver<DeliveryError>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockProducer {
    /// Records every message it receives
    pub fn accepting(name: impl Into<String>) -> Self {
        Self::start(name.into(), None)
    }

    /// Fails every message with `reason`
    pub fn rejecting(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::start(name.into(), Some(reason.into()))
    }

    /// Make `close` report a failure after draining
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    fn start(name: String, reject: Option<String>) -> Self {
        let (input_tx, mut input_rx) = mpsc::channel::<Message>(1);
        let (error_tx, error_rx) = mpsc::channel(16);
        let accepted = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&accepted);
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = input_rx.recv().await {
                match &reject {
                    None => {
                        tracing::info!(producer = %task_name, topic = message.topic(), "Mock publish");
                        lock(&sink).push(message);
                    }
                    Some(reason) => {
                        let failure = DeliveryError::new(vec![message], reason.clone());
                        if error_tx.send(failure).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            accepted,
            healthy: AtomicBool::new(true),
            fail_close: false,
            input: Mutex::new(Some(input_tx)),
            errors: Mutex::new(Some(error_rx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Messages delivered so far
    pub fn accepted(&self) -> Vec<Message> {
        lock(&self.accepted).clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Producer for MockProducer {
    fn name(&self) -> &str {
        &self.name
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
        let task = lock(&self.task)
            .take()
            .ok_or_else(|| ProducerError::AlreadyClosed(self.name.clone()))?;

        drop(lock(&self.input).take());
        task.await.map_err(|source| ProducerError::Task {
            name: self.name.clone(),
            source,
        })?;

        if self.fail_close {
            return Err(ProducerError::Close {
                name: self.name.clone(),
                reason: "mock close failure".to_string(),
            });
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
