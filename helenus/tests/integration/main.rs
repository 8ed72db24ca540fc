mod authenticate;
mod compression;
mod cql3;
mod pool;
mod session;
pub(crate) mod utils;
