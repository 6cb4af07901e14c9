//! CQL binary protocol (v4) frames and primitives.
//!
//! Mainly intended to be used by `cassandra-driver`: request encoding,
//! response frame reading and parsing, body compression and the error
//! codes a coordinator can answer with.

pub mod errors;
pub mod frame;

pub use crate::frame::types::Consistency;
pub use crate::frame::types::SerialConsistency;
