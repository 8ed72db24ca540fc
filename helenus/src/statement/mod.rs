//! Statement text handling and per-statement settings.

pub mod bind_markers;

pub use helenus_cql::frame::types::{Consistency, SerialConsistency};
