//! This module contains various errors which can be returned by [`Session`](crate::client::session::Session).

use std::sync::Arc;
use std::time::Duration;

pub use helenus_cql::frame::frame_errors::CqlTypeError;
pub use helenus_cql::frame::response::error::{DbError, WriteType};

use helenus_cql::frame::frame_errors::{FrameError, ParseError};
use helenus_cql::frame::response::Error as CqlError;
use helenus_cql::frame::value::SerializeValuesError;
use thiserror::Error;

/// Error that occurred during query execution
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum QueryError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Caller passed an invalid query
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Input/Output error has occurred, connection broken etc.
    #[error("IO Error: {0}")]
    IoError(Arc<std::io::Error>),

    /// Unexpected message received
    #[error("Protocol Error: {0}")]
    ProtocolError(&'static str),

    /// Invalid message received: the frame or its body could not be parsed
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A column value could not be decoded into its declared type
    #[error("Type error: {0}")]
    TypeError(#[from] CqlTypeError),

    /// The connection the request was sent on broke before a response arrived.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The pool had no usable connection for this request.
    #[error("No connections in the pool: {0}")]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// Client timeout occurred before any response arrived
    #[error("Request timeout: no response received within {0:?}")]
    RequestTimeout(Duration),

    /// The session was closed before or while the request was issued
    #[error("Session is closed")]
    SessionClosed,
}

impl QueryError {
    /// Stable name of the error kind.
    ///
    /// Several variants share a name: everything that means "the transport
    /// could not deliver an answer" is a `ConnectionError`, while server
    /// rejections of the statement itself are `InvalidRequestException`.
    pub fn name(&self) -> &'static str {
        match self {
            QueryError::DbError(db_error, _) => db_error_name(db_error),
            QueryError::BadQuery(_) => "InvalidRequestException",
            QueryError::ProtocolError(_) | QueryError::InvalidMessage(_) => "ProtocolError",
            QueryError::TypeError(_) => "TypeError",
            QueryError::IoError(_)
            | QueryError::BrokenConnection(_)
            | QueryError::ConnectionPoolError(_)
            | QueryError::UnableToAllocStreamId
            | QueryError::RequestTimeout(_)
            | QueryError::SessionClosed => "ConnectionError",
        }
    }

    /// Whether the error was caused by losing (or never having) a connection.
    pub fn is_connection_error(&self) -> bool {
        self.name() == "ConnectionError"
    }
}

fn db_error_name(db_error: &DbError) -> &'static str {
    match db_error {
        DbError::SyntaxError
        | DbError::Invalid
        | DbError::AlreadyExists { .. }
        | DbError::ConfigError
        | DbError::Unauthorized => "InvalidRequestException",
        DbError::Unavailable { .. } => "UnavailableException",
        DbError::ReadTimeout { .. } | DbError::WriteTimeout { .. } => "TimedOutException",
        DbError::AuthenticationError => "AuthenticationException",
        DbError::ProtocolError => "ProtocolError",
        _ => "ServerError",
    }
}

/// Error caused by caller creating an invalid query
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    /// Failed to serialize values passed to a query - values too big
    #[error("Serializing values failed: {0} ")]
    SerializeValuesError(#[from] SerializeValuesError),

    /// The statement has a different number of `?` markers than values were given
    #[error("Statement has {markers} bind markers, but {values} values were provided")]
    ValueCountMismatch { markers: usize, values: usize },

    /// Named bind markers (`:name`) were used; only positional `?` markers are supported
    #[error("Named bind marker :{0} is not supported, use positional ? markers")]
    NamedMarkersUnsupported(String),

    /// Passed invalid keyspace name to use
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// Other reasons of bad query
    #[error("{0}")]
    Other(String),
}

/// Invalid keyspace name given to `Session::use_keyspace()`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Error that occurred during session creation
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// Failed to resolve hostname passed in Session creation
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// List of known nodes passed to Session constructor is empty
    /// There needs to be at least one node to connect to
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// Passed keyspace name was invalid
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// No connection could be opened to any of the known nodes
    #[error("Could not connect to any known node, last error: {0}")]
    NoConnections(ConnectionError),

    /// Switching to the configured keyspace failed
    #[error("Failed to use keyspace: {0}")]
    UseKeyspaceError(#[from] UseKeyspaceError),
}

/// Error occurring during `Session::use_keyspace()`
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    /// Caller passed invalid keyspace name
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The USE request failed
    #[error(transparent)]
    RequestError(#[from] QueryError),

    /// The server switched to a different keyspace than requested
    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },

    /// Not every connection switched keyspace in time
    #[error("USE KEYSPACE request timed out after {0:?}")]
    RequestTimeout(Duration),
}

/// Error that occurred while opening a connection or that broke an open one.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Connect timeout elapsed before the TCP connection was established
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error occurred
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// The connection broke after it was opened
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// One of the requests of the OPTIONS/STARTUP/AUTH handshake failed
    #[error("Failed to perform {request} request during connection setup: {error}")]
    SetupRequestError {
        request: &'static str,
        error: Box<QueryError>,
    },

    /// The authenticator rejected the server's challenge or success message
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server required authentication but no credentials were configured
    #[error("Server requires authentication ({0}) but no authenticator was configured")]
    MissingAuthentication(String),

    /// The configured keyspace could not be set on the new connection
    #[error("Failed to set keyspace on new connection: {0}")]
    UseKeyspace(Box<UseKeyspaceError>),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

impl From<UseKeyspaceError> for ConnectionError {
    fn from(value: UseKeyspaceError) -> Self {
        ConnectionError::UseKeyspace(Box::new(value))
    }
}

/// The pool could not hand out a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// No connection could be kept open; holds the most recent error
    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },

    /// The pool has not finished its first fill yet
    #[error("Pool is still being initialized")]
    Initializing,

    /// The pool was closed
    #[error("Pool is closed")]
    Closed,
}

/// Error that broke an open connection. Every request in flight on it fails
/// with a clone of this error.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<dyn std::error::Error + Sync + Send>);

impl BrokenConnectionError {
    /// Retrieve an error reason by downcasting to specific type.
    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// The reason a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Reading a frame from the socket failed
    #[error("Failed to read a frame: {0}")]
    FrameError(#[from] FrameError),

    /// Writing to the socket failed
    #[error("Failed to write data: {0}")]
    WriteError(std::io::Error),

    /// Too many requests timed out without their responses ever arriving
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// The server answered on a stream no request was waiting on
    #[error("Received a server frame with unexpected stream id: {0}")]
    UnexpectedStreamId(i16),

    /// The router task is gone; the connection already broke for another reason
    #[error(
        "Failed to send/receive data needed to perform a request via tokio channel. \
        It implies that other half of the channel has been dropped. \
        The connection was already broken for some other reason."
    )]
    ChannelError,

    /// The connection was closed by the client
    #[error("Connection was closed")]
    Closed,
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

impl From<std::io::Error> for QueryError {
    fn from(io_error: std::io::Error) -> QueryError {
        QueryError::IoError(Arc::new(io_error))
    }
}

impl From<SerializeValuesError> for QueryError {
    fn from(serialized_err: SerializeValuesError) -> QueryError {
        QueryError::BadQuery(BadQuery::SerializeValuesError(serialized_err))
    }
}

impl From<ParseError> for QueryError {
    fn from(parse_error: ParseError) -> QueryError {
        match parse_error {
            ParseError::CqlTypeError(type_error) => QueryError::TypeError(type_error),
            other => QueryError::InvalidMessage(format!("Error parsing message: {}", other)),
        }
    }
}

impl From<FrameError> for QueryError {
    fn from(frame_error: FrameError) -> QueryError {
        match frame_error {
            FrameError::Parse(parse_error) => parse_error.into(),
            other => QueryError::InvalidMessage(format!("Frame error: {}", other)),
        }
    }
}

impl From<BadKeyspaceName> for QueryError {
    fn from(keyspace_err: BadKeyspaceName) -> QueryError {
        QueryError::BadQuery(BadQuery::BadKeyspaceName(keyspace_err))
    }
}

impl From<ConnectionError> for QueryError {
    fn from(value: ConnectionError) -> Self {
        match value {
            ConnectionError::BrokenConnection(e) => QueryError::BrokenConnection(e),
            ConnectionError::IoError(e) => QueryError::IoError(e),
            other => QueryError::ConnectionPoolError(ConnectionPoolError::Broken {
                last_connection_error: other,
            }),
        }
    }
}

impl From<CqlError> for QueryError {
    fn from(error: CqlError) -> QueryError {
        QueryError::DbError(error.error, error.reason)
    }
}
