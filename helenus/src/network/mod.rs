//! Connections to the database nodes and the pool that keeps them open.

mod connection;
mod connection_pool;

pub use connection::ConnectionState;
pub use connection_pool::{LoadBalancing, ReconnectPolicy};

pub(crate) use connection::{ConnectionConfig, VerifiedKeyspaceName, DEFAULT_MAX_IN_FLIGHT};
pub(crate) use connection_pool::{ConnectionPool, PoolConfig};
