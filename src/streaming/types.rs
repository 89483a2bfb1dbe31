use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::storage::StorageError;

/// Boxed cause carried by a failed delivery
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single message moving through the pipeline
///
/// Messages are immutable once built. `key` and `data` are raw bytes but are
/// written to the overflow store as JSON strings, so they must hold UTF-8 to be
/// persisted there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "utf8_opt")]
    key: Option<Bytes>,
    #[serde(with = "utf8")]
    data: Bytes,
}

impl Message {
    /// Build a message. An empty key means "no key".
    pub fn new(topic: impl Into<String>, key: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        let key = key.into();
        Self {
            topic: topic.into(),
            key: (!key.is_empty()).then_some(key),
            data: data.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Bytes as a JSON string
mod utf8 {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, ser::Error};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = std::str::from_utf8(bytes).map_err(S::Error::custom)?;
        serializer.serialize_str(text)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Bytes::from(String::deserialize(deserializer)?))
    }
}

/// Optional bytes as a JSON string; older batches omit the field entirely
mod utf8_opt {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => super::utf8::serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = Option::<String>::deserialize(deserializer)?;
        Ok(text.filter(|t| !t.is_empty()).map(Bytes::from))
    }
}

/// A failed delivery attempt for a whole batch
///
/// The batch is always handed to the next stage as a unit.
#[derive(Debug, Error)]
#[error("delivery of {} message(s) failed: {cause}", .messages.len())]
pub struct DeliveryError {
    pub messages: Vec<Message>,
    pub cause: BoxError,
}

impl DeliveryError {
    pub fn new(messages: Vec<Message>, cause: impl Into<BoxError>) -> Self {
        Self {
            messages,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("producer {0} is already closed")]
    AlreadyClosed(String),

    #[error("producer {name} task failed: {source}")]
    Task {
        name: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("producer {name} failed to close: {reason}")]
    Close { name: String, reason: String },
}

/// A delivery backend that can take part in the fallback chain
///
/// Messages go in through [`Producer::input`]; anything the backend could not
/// deliver comes back out through the error stream, which closes once the
/// producer has been closed and fully drained.
#[async_trait]
pub trait Producer: Send + Sync {
    fn name(&self) -> &str;

    /// Input sink. `None` once the producer has been closed.
    fn input(&self) -> Option<mpsc::Sender<Message>>;

    /// Error source. Can be taken exactly once.
    fn take_errors(&self) -> Option<mpsc::Receiver<DeliveryError>>;

    /// True until the error stream has been taken
    fn has_errors(&self) -> bool;

    /// Stop accepting input, flush, and wait for in-flight work.
    async fn close(&self) -> Result<(), ProducerError>;

    fn is_healthy(&self) -> bool;
}

/// A batch read back from durable storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBatch {
    /// Object key the batch was stored under
    pub key: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to decode batch {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads previously stored batches back for replay
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Lazily stream every batch written up to and including `until`, in the
    /// order it was written. Read failures arrive on the second channel.
    fn output(
        &self,
        until: DateTime<Utc>,
    ) -> (mpsc::Receiver<StoredBatch>, mpsc::Receiver<ConsumerError>);

    /// Remove a batch once its messages have been handed on.
    async fn commit(&self, key: &str) -> Result<(), ConsumerError>;

    async fn close(&self) -> Result<(), ConsumerError>;

    fn is_healthy(&self) -> bool;
}

/// Lock a handle mutex; poisoning only means another holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
