//! Core shared types for beacon service discovery
//!
//! This crate contains the instance record advertised by a running service
//! instance and the codec contract used to store it in the coordination store.

mod codec;
mod record;

pub use codec::{CodecError, JsonRecordCodec, RecordCodec};
pub use record::{InstanceRecord, RecordError};
