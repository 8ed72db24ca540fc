//! Async CQL driver speaking the binary protocol over multiplexed,
//! optionally compressed connections.
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them:
//!
//! ```rust,no_run
//! use helenus::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! `Session` is usually created using the [SessionBuilder].\
//! All configuration options for a `Session` can be specified while building.
//!
//! ### Making queries
//! Statements take positional `?` markers; values are sent typed, next to
//! the statement text. The easiest way to pass them is a tuple:
//! ```rust
//! # use helenus::Session;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! session
//!     .query(
//!         "INSERT INTO ks.tab (a, b) VALUES(?, ?)",
//!         (2_i32, "some text")
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//! Per-call compression and consistency go through
//! [`Session::query_with_options`] and [ExecutionOptions].
//!
//! ### Receiving results
//! Rows keep every column the server sent, null ones included, and can be
//! read by name or by position:
//!
//! ```rust
//! # use helenus::Session;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! let rows = session
//!     .query("SELECT a, b FROM ks.tab", ())
//!     .await?
//!     .rows_or_empty();
//!
//! for row in rows {
//!     let a = row.get_value("a").and_then(|v| v.as_int());
//!     let b = row.get_by_index(1).and_then(|c| c.value.as_ref());
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod frame {
    pub use helenus_cql::frame::{frame_errors, value, Compression};

    pub mod types {
        pub use helenus_cql::frame::types::{Consistency, SerialConsistency};
    }

    pub mod response {
        pub use helenus_cql::frame::response::result::{ColumnSpec, ColumnType, TableSpec};
    }
}

pub mod value {
    pub use helenus_cql::value::*;
}

pub use helenus_cql::row::{Column, Row};
pub use helenus_cql::value::CqlValue;

pub mod authentication;
pub mod client;
pub mod errors;
pub mod response;
pub mod statement;

pub(crate) mod network;
pub(crate) mod utils;

pub use client::execution_options::ExecutionOptions;
pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
pub use client::{Compression, ConnectionState, LoadBalancing, ReconnectPolicy};
pub use errors::{NewSessionError, QueryError};
pub use response::QueryResult;
pub use statement::Consistency;
