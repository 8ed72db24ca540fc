//! Results handed back by [`Session`](crate::client::session::Session).

mod query_result;

pub use query_result::{
    FirstRowError, QueryResult, RowsExpectedError, RowsNotExpectedError, SingleRowError,
};
