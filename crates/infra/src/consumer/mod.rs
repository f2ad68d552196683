//! [`Consumer`](eventmill_events::Consumer) implementations.

pub mod queue;
pub mod stream;

pub use queue::{QueueConsumer, QueueConsumerConfig};
pub use stream::{AdvancePolicy, DrainReason, FetchState, StreamConsumer, StreamConsumerConfig};
