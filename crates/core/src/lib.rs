//! `eventmill-core`: the event model shared by producers, consumers and workers.
//!
//! This crate has no IO. It defines:
//! - [`Event`]: the unit flowing through the whole pipeline (name + opaque payload)
//! - the payload codec used to put structured values into an event and get them back
//! - shard/sequence identifiers used by log consumers and checkpoint stores

pub mod error;
pub mod event;
pub mod id;

pub use error::{CodecError, CodecResult};
pub use event::Event;
pub use id::{SequenceNumber, ShardId};
