//! Delivery backends and the capabilities the pipeline needs from them

pub mod batch;
pub mod http;
pub mod mock;
pub mod types;

pub use batch::{BatchConfig, BatchConsumer, BatchProducer};
pub use http::{HttpConfig, HttpProducer, HttpProducerError};
pub use mock::MockProducer;
pub use types::{
    BoxError, Consumer, ConsumerError, DeliveryError, Message, Producer, ProducerError,
    StoredBatch,
};
