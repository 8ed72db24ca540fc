//! CQL protocol-level types for the helenus driver: frames, wire types,
//! value marshalling and the row model handed back to callers.
//!
//! Mainly intended to be used by `helenus`, but the codec is complete
//! enough to build a scripted server on top of it, which is how the
//! driver's integration tests run.

pub mod frame;
pub mod row;
pub mod value;

pub use crate::frame::types::Consistency;
pub use crate::frame::Compression;
pub use crate::row::{Column, Row};
