//! This module holds entities that represent the whole database cluster
//! and the configuration of a connection to it.

pub mod execution_options;
pub mod session;
pub mod session_builder;

pub use crate::network::{ConnectionState, LoadBalancing, ReconnectPolicy};
pub use helenus_cql::frame::Compression;
