//! Infrastructure: log and queue backends, checkpoint stores, consumers,
//! producers, retry policy and environment configuration.

pub mod backoff;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod log;
pub mod producer;
pub mod queue;


pub use backoff::{BackoffConfig, ExponentialBackoff, RetryError, retry, retry_if};
pub use checkpoint::{CheckpointError, CheckpointKey, CheckpointStore, Checkpointer};
pub use config::{ConfigError, Settings};
pub use consumer::{
    AdvancePolicy, QueueConsumer, QueueConsumerConfig, StreamConsumer, StreamConsumerConfig,
};
pub use log::{LogError, ShardLog};
pub use producer::{LogProducer, Producer, ProducerError, QueueProducer};
pub use queue::{MessageQueue, QueueError};
