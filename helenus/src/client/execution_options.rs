use std::time::Duration;

use helenus_cql::frame::Compression;

use crate::statement::{Consistency, SerialConsistency};

/// Per-call options of [`Session::query_with_options`](crate::client::session::Session::query_with_options).
///
/// Every field left at its default falls back to the session configuration.
///
/// # Example
/// ```
/// # use helenus::client::execution_options::ExecutionOptions;
/// # use helenus::statement::Consistency;
/// let opts = ExecutionOptions::new()
///     .with_compression(true)
///     .with_consistency(Consistency::Quorum);
/// assert_eq!(opts.compression, Some(true));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// `Some(false)` sends this request uncompressed even if the connection
    /// negotiated compression. `None` and `Some(true)` compress whenever a
    /// compression algorithm was negotiated.
    pub compression: Option<bool>,
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<SerialConsistency>,
    /// Ask the server to trace this request; the id ends up in
    /// [`QueryResult::tracing_id`](crate::response::QueryResult::tracing_id).
    pub tracing: bool,
    /// Client-side write timestamp in microseconds since the epoch.
    pub timestamp: Option<i64>,
    /// Overrides the session's request timeout.
    pub request_timeout: Option<Duration>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn with_serial_consistency(mut self, serial_consistency: SerialConsistency) -> Self {
        self.serial_consistency = Some(serial_consistency);
        self
    }

    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Determines the consistency of a query
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }

    /// Compression to apply to the request body, given what the connection negotiated.
    #[must_use]
    pub(crate) fn determine_compression(
        &self,
        negotiated: Option<Compression>,
    ) -> Option<Compression> {
        match self.compression {
            Some(false) => None,
            Some(true) | None => negotiated,
        }
    }

    #[must_use]
    pub(crate) fn determine_request_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.request_timeout.or(default)
    }
}
