//! Consumer contract, event stream and dispatch engine (mechanics only).
//!
//! ```text
//! Consumer::start ──► EventSink ══(unbuffered)══► EventStream ──► DispatchEngine
//!                                                                   ├─ DispatchTable (name → tasks)
//!                                                                   └─ bounded task pool
//! ```
//!
//! Nothing here knows about a concrete log or queue; backends live in
//! `eventmill-infra`.

pub mod consumer;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod in_memory;
pub mod stream;
pub mod task;

pub use consumer::{Consumer, Lifecycle, STOP_TIMEOUT};
pub use dispatch::{DispatchTable, TaskFactory};
pub use engine::{DispatchEngine, EngineConfig, EngineStats, JobLimit};
pub use error::{ConsumerError, DispatchError, StreamError};
pub use in_memory::{InMemoryConsumer, InMemoryPublisher};
pub use stream::{EventSink, EventStream, event_stream};
pub use task::{FnTask, Task, TaskContext, TaskOutput};
