//! Batch buffering producer and its replay consumer
//!
//! [`BatchProducer`] is the durable overflow stage. Messages are gathered into
//! a batch that is flushed when it holds `flush_messages` messages or when
//! `flush_frequency` has passed since its first message, whichever comes
//! first. Flushed batches are handed to a writer task over a small bounded
//! queue, so slow storage does not stall buffering until that queue fills.
//!
//! Each batch becomes one JSON array object named `<uuid-v7>.json`, which makes
//! a plain key listing come back in write order. [`BatchConsumer`] relies on
//! that to read batches back for replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{
    BoxError, Consumer, ConsumerError, DeliveryError, Message, Producer, ProducerError,
    StoredBatch, lock,
};
use crate::storage::{BlobStore, ObjectInfo};

const NAME: &str = "overflow";

pub const DEFAULT_FLUSH_MESSAGES: usize = 20_000;
pub const DEFAULT_FLUSH_FREQUENCY: Duration = Duration::from_secs(5);

/// Flushed batches waiting for the writer
const HANDOFF_CAPACITY: usize = 10;
const INPUT_CAPACITY: usize = 1;
const ERROR_CAPACITY: usize = 16;
/// Batches read ahead of the replay driver
const OUTPUT_CAPACITY: usize = 10;

const BATCH_SUFFIX: &str = ".json";

#[derive(Debug, Clone, bon::Builder)]
pub struct BatchConfig {
    /// Flush once the open batch holds this many messages
    #[builder(default = DEFAULT_FLUSH_MESSAGES)]
    pub flush_messages: usize,
    /// Flush this long after the first message of a batch arrived
    #[builder(default = DEFAULT_FLUSH_FREQUENCY)]
    pub flush_frequency: Duration,
    /// Directory-like prefix for batch objects
    #[builder(default, into)]
    pub prefix: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Overflow producer persisting batches to a [`BlobStore`]
pub struct BatchProducer {
    input: Mutex<Option<mpsc::Sender<Message>>>,
    errors: Mutex<Option<mpsc::Receiver<DeliveryError>>>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl BatchProducer {
    /// Start the buffering and writer tasks. Must be called within a Tokio runtime.
    pub fn new(store: Arc<dyn BlobStore>, config: BatchConfig) -> Self {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(HANDOFF_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CAPACITY);

        let flush_messages = config.flush_messages.max(1);
        info!(
            flush_messages,
            flush_frequency_ms = config.flush_frequency.as_millis() as u64,
            prefix = %config.prefix,
            "Starting overflow producer"
        );

        let dispatcher = tokio::spawn(dispatch_messages(
            input_rx,
            batch_tx,
            flush_messages,
            config.flush_frequency,
        ));
        let writer = tokio::spawn(write_batches(store, config.prefix, batch_rx, error_tx));

        Self {
            input: Mutex::new(Some(input_tx)),
            errors: Mutex::new(Some(error_rx)),
            tasks: Mutex::new(Some((dispatcher, writer))),
        }
    }
}

#[async_trait]
impl Producer for BatchProducer {
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

    /// Flushes the open batch even if it is below the count threshold, then
    /// waits for the writer. The error stream closes when this returns.
    async fn close(&self) -> Result<(), ProducerError> {
        let (dispatcher, writer) = lock(&self.tasks)
            .take()
            .ok_or_else(|| ProducerError::AlreadyClosed(NAME.to_string()))?;

        drop(lock(&self.input).take());

        let dispatched = dispatcher.await;
        let written = writer.await;

        dispatched
            .and(written)
            .map_err(|source| ProducerError::Task {
                name: NAME.to_string(),
                source,
            })
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// The batch currently being filled
struct PendingBatch {
    messages: Vec<Message>,
    limit: usize,
    deadline: Option<Instant>,
}

impl PendingBatch {
    fn new(limit: usize) -> Self {
        Self {
            messages: Vec::with_capacity(limit.min(1024)),
            limit,
            deadline: None,
        }
    }

    /// Arms the flush timer when the batch goes from empty to non-empty
    fn push(&mut self, message: Message, flush_frequency: Duration) {
        if self.messages.is_empty() {
            self.deadline = Some(Instant::now() + flush_frequency);
        }
        self.messages.push(message);
    }

    fn is_full(&self) -> bool {
        self.messages.len() >= self.limit
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn take(&mut self) -> Vec<Message> {
        self.deadline = None;
        std::mem::replace(&mut self.messages, Vec::with_capacity(self.limit.min(1024)))
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn dispatch_messages(
    mut input: mpsc::Receiver<Message>,
    output: mpsc::Sender<Vec<Message>>,
    flush_messages: usize,
    flush_frequency: Duration,
) {
    let mut batch = PendingBatch::new(flush_messages);

    loop {
        tokio::select! {
            received = input.recv() => match received {
                Some(message) => {
                    batch.push(message, flush_frequency);
                    if batch.is_full() {
                        flush(&mut batch, &output, "size").await;
                    }
                }
                None => break,
            },
            _ = wait_for(batch.deadline) => {
                flush(&mut batch, &output, "timer").await;
            }
        }
    }

    if !batch.is_empty() {
        flush(&mut batch, &output, "close").await;
    }
    debug!("Overflow input drained");
}

async fn flush(batch: &mut PendingBatch, output: &mpsc::Sender<Vec<Message>>, trigger: &str) {
    let messages = batch.take();
    let count = messages.len();
    debug!(count, trigger, "Flushing batch");

    if output.send(messages).await.is_err() {
        error!(count, "Batch writer stopped, batch dropped");
    }
}

async fn write_batches(
    store: Arc<dyn BlobStore>,
    prefix: String,
    mut batches: mpsc::Receiver<Vec<Message>>,
    errors: mpsc::Sender<DeliveryError>,
) {
    while let Some(messages) = batches.recv().await {
        let count = messages.len();

        match write_batch(store.as_ref(), &prefix, &messages).await {
            Ok(key) => info!(key, count, "Batch written"),
            Err(cause) => {
                warn!(count, error = %cause, "Batch write failed");
                if errors.send(DeliveryError::new(messages, cause)).await.is_err() {
                    error!(count, "Error stream closed, failed batch dropped");
                }
            }
        }
    }
}

async fn write_batch(
    store: &dyn BlobStore,
    prefix: &str,
    messages: &[Message],
) -> Result<String, BoxError> {
    let body = serde_json::to_vec(messages)?;
    let key = batch_key(prefix);
    store.upload(&key, body).await?;
    Ok(key)
}

/// Unique, time-sortable object key for a new batch
pub fn batch_key(prefix: &str) -> String {
    let name = format!("{}{}", Uuid::now_v7(), BATCH_SUFFIX);
    match prefix.trim_end_matches('/') {
        "" => name,
        prefix => format!("{prefix}/{name}"),
    }
}

/// Write time embedded in a batch key, if the key is one of ours
pub fn key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let name = key.rsplit('/').next()?;
    let id = Uuid::parse_str(name.strip_suffix(BATCH_SUFFIX)?).ok()?;
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
}

fn written_at(object: &ObjectInfo) -> DateTime<Utc> {
    key_timestamp(&object.key).unwrap_or(object.last_modified)
}

/// Replay source reading batches written by [`BatchProducer`]
pub struct BatchConsumer {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl BatchConsumer {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Consumer for BatchConsumer {
    fn output(
        &self,
        until: DateTime<Utc>,
    ) -> (mpsc::Receiver<StoredBatch>, mpsc::Receiver<ConsumerError>) {
        let (batch_tx, batch_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(OUTPUT_CAPACITY);

        tokio::spawn(read_batches(
            Arc::clone(&self.store),
            self.prefix.trim_end_matches('/').to_string(),
            until,
            batch_tx,
            error_tx,
        ));

        (batch_rx, error_rx)
    }

    async fn commit(&self, key: &str) -> Result<(), ConsumerError> {
        self.store.delete(key).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConsumerError> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

async fn read_batches(
    store: Arc<dyn BlobStore>,
    prefix: String,
    until: DateTime<Utc>,
    batches: mpsc::Sender<StoredBatch>,
    errors: mpsc::Sender<ConsumerError>,
) {
    let mut objects = match store.list(&prefix).await {
        Ok(objects) => objects,
        Err(e) => {
            let _ = errors.send(e.into()).await;
            return;
        }
    };

    objects.retain(|object| object.key.ends_with(BATCH_SUFFIX));
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    info!(count = objects.len(), %until, "Listed stored batches");

    for object in objects {
        // Keys sort by write time, so nothing after this one is old enough
        if written_at(&object) > until {
            debug!(key = %object.key, "Reached batches newer than cutoff");
            break;
        }

        match read_batch(store.as_ref(), &object.key).await {
            Ok(messages) => {
                let batch = StoredBatch {
                    key: object.key,
                    messages,
                };
                if batches.send(batch).await.is_err() {
                    debug!("Batch receiver dropped, stopping listing");
                    return;
                }
            }
            Err(e) => {
                warn!(key = %object.key, error = %e, "Skipping unreadable batch");
                let _ = errors.send(e).await;
            }
        }
    }
}

async fn read_batch(store: &dyn BlobStore, key: &str) -> Result<Vec<Message>, ConsumerError> {
    let body = store.download(key).await?;
    serde_json::from_slice(&body).map_err(|source| ConsumerError::Decode {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageClient, StorageError, UploadMetadata};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{sleep, timeout};

    /// Storage that can be switched into failing uploads
    struct FlakyStore {
        inner: StorageClient,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new(failing: bool) -> Self {
            Self {
                inner: StorageClient::in_memory(),
                failing: AtomicBool::new(failing),
            }
        }
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn upload(&self, key: &str, data: Vec<u8>) -> crate::storage::Result<UploadMetadata> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::InvalidConfig("bucket unavailable".into()));
            }
            self.inner.upload(key, data).await
        }

        async fn download(&self, key: &str) -> crate::storage::Result<Vec<u8>> {
            self.inner.download(key).await
        }

        async fn list(&self, prefix: &str) -> crate::storage::Result<Vec<ObjectInfo>> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> crate::storage::Result<()> {
            self.inner.delete(key).await
        }
    }

    async fn stored_batches(store: &dyn BlobStore, prefix: &str) -> Vec<Vec<Message>> {
        let mut objects = store.list(prefix).await.unwrap();
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        let mut batches = Vec::new();
        for object in objects {
            let body = store.download(&object.key).await.unwrap();
            batches.push(serde_json::from_slice(&body).unwrap());
        }
        batches
    }

    fn producer(store: Arc<dyn BlobStore>, flush_messages: usize, flush_frequency: Duration) -> BatchProducer {
        BatchProducer::new(
            store,
            BatchConfig::builder()
                .flush_messages(flush_messages)
                .flush_frequency(flush_frequency)
                .build(),
        )
    }

    #[tokio::test]
    async fn test_flushes_on_message_count() {
        let store: Arc<dyn BlobStore> = Arc::new(StorageClient::in_memory());
        let producer = producer(store.clone(), 3, Duration::from_secs(60));
        let input = producer.input().unwrap();

        for i in 0..3 {
            input.send(Message::new("t", "", format!("d{i}"))).await.unwrap();
        }
        sleep(Duration::from_millis(100)).await;

        let batches = stored_batches(store.as_ref(), "").await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0][2].data().as_ref(), b"d2");
    }

    #[tokio::test]
    async fn test_flushes_on_timer() {
        let store: Arc<dyn BlobStore> = Arc::new(StorageClient::in_memory());
        let producer = producer(store.clone(), 3, Duration::from_millis(50));
        let input = producer.input().unwrap();

        input.send(Message::new("t", "k", "only")).await.unwrap();
        sleep(Duration::from_millis(200)).await;

        let batches = stored_batches(store.as_ref(), "").await;
        assert_eq!(batches, vec![vec![Message::new("t", "k", "only")]]);
    }

    #[tokio::test]
    async fn test_close_flushes_partial_batch() {
        let store: Arc<dyn BlobStore> = Arc::new(StorageClient::in_memory());
        let producer = producer(store.clone(), 100, Duration::from_secs(60));
        let mut errors = producer.take_errors().unwrap();
        let input = producer.input().unwrap();

        input.send(Message::new("t", "", "a")).await.unwrap();
        input.send(Message::new("t", "", "b")).await.unwrap();
        drop(input);

        producer.close().await.unwrap();

        let batches = stored_batches(store.as_ref(), "").await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(errors.recv().await.is_none());
        assert!(producer.input().is_none());
    }

    #[tokio::test]
    async fn test_failed_write_returns_whole_batch() {
        let store = Arc::new(FlakyStore::new(true));
        let producer = producer(store.clone(), 2, Duration::from_secs(60));
        let mut errors = producer.take_errors().unwrap();
        let input = producer.input().unwrap();

        input.send(Message::new("t", "", "a")).await.unwrap();
        input.send(Message::new("t", "", "b")).await.unwrap();

        let failure = timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.messages.len(), 2);
        assert_eq!(failure.messages[0].data().as_ref(), b"a");
        assert!(failure.cause.to_string().contains("bucket unavailable"));
    }

    #[tokio::test]
    async fn test_unserializable_batch_is_returned() {
        let store: Arc<dyn BlobStore> = Arc::new(StorageClient::in_memory());
        let producer = producer(store.clone(), 1, Duration::from_secs(60));
        let mut errors = producer.take_errors().unwrap();
        let input = producer.input().unwrap();

        input.send(Message::new("t", "", vec![0xff])).await.unwrap();

        let failure = timeout(Duration::from_secs(1), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.messages.len(), 1);
        assert!(stored_batches(store.as_ref(), "").await.is_empty());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let producer = producer(Arc::new(StorageClient::in_memory()), 1, Duration::from_secs(1));
        producer.close().await.unwrap();
        assert!(matches!(
            producer.close().await,
            Err(ProducerError::AlreadyClosed(_))
        ));
    }

    #[test]
    fn test_batch_keys_sort_by_time() {
        let first = batch_key("overflow/");
        std::thread::sleep(Duration::from_millis(2));
        let second = batch_key("overflow");

        assert!(first.starts_with("overflow/"));
        assert!(first.ends_with(".json"));
        assert!(first < second);
        assert!(key_timestamp(&first).unwrap() <= key_timestamp(&second).unwrap());
        assert!(key_timestamp("overflow/notes.txt").is_none());
    }

    #[tokio::test]
    async fn test_consumer_reads_in_order_until_cutoff() {
        let store: Arc<dyn BlobStore> = Arc::new(StorageClient::in_memory());

        let first = batch_key("overflow");
        store
            .upload(&first, br#"[{"topic":"t","data":"1"}]"#.to_vec())
            .await
            .unwrap();
        sleep(Duration::from_millis(5)).await;
        let second = batch_key("overflow");
        store
            .upload(&second, br#"[{"topic":"t","key":"k","data":"2"}]"#.to_vec())
            .await
            .unwrap();

        let cutoff = Utc::now();
        sleep(Duration::from_millis(5)).await;
        store
            .upload(&batch_key("overflow"), br#"[{"topic":"t","data":"3"}]"#.to_vec())
            .await
            .unwrap();

        let consumer = BatchConsumer::new(store, "overflow/");
        let (mut batches, _errors) = consumer.output(cutoff);

        let mut seen = Vec::new();
        while let Some(batch) = batches.recv().await {
            seen.push(batch);
        }

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].key, first);
        assert_eq!(seen[1].key, second);
        assert_eq!(seen[1].messages[0].key().unwrap().as_ref(), b"k");
    }

    #[tokio::test]
    async fn test_consumer_reports_corrupt_batch_and_continues() {
        let store: Arc<dyn BlobStore> = Arc::new(StorageClient::in_memory());
        let bad = batch_key("");
        store.upload(&bad, b"not json".to_vec()).await.unwrap();
        sleep(Duration::from_millis(2)).await;
        let good = batch_key("");
        store
            .upload(&good, br#"[{"topic":"t","data":"ok"}]"#.to_vec())
            .await
            .unwrap();

        let consumer = BatchConsumer::new(store.clone(), "");
        let (mut batches, mut errors) = consumer.output(Utc::now());

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.key, good);
        assert!(batches.recv().await.is_none());

        let err = errors.recv().await.unwrap();
        assert!(matches!(err, ConsumerError::Decode { ref key, .. } if *key == bad));

        consumer.commit(&good).await.unwrap();
        let remaining = store.list("").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, bad);
    }
}
