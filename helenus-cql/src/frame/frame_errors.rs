//! Errors raised while framing, compressing and parsing protocol messages.

use super::TryFromPrimitiveError;
use crate::frame::value::SerializeValuesError;
use std::sync::Arc;
use thiserror::Error;

/// An error raised while reading, writing or unwrapping a whole frame.
///
/// Errors raised by the transport itself (`StdIoError`, `ConnectionClosed`)
/// leave the stream in an unknown position and are fatal to the connection.
/// The rest only concern the body of a single frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame marked as coming from a server")]
    FrameFromServer,
    #[error("Received a frame from version {0}, but only 4 is supported")]
    VersionNotSupported(u8),
    #[error("Frame body length {0} exceeds the maximum of {1} bytes")]
    FrameTooLarge(usize, usize),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error("Unrecognized opcode {0}")]
    TryFromPrimitiveError(#[from] TryFromPrimitiveError<u8>),
}

impl FrameError {
    /// Whether the error leaves the byte stream in an unknown state.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            FrameError::StdIoError(_)
                | FrameError::ConnectionClosed(_, _)
                | FrameError::FrameFromClient
                | FrameError::FrameFromServer
                | FrameError::VersionNotSupported(_)
                | FrameError::FrameTooLarge(_, _)
                | FrameError::TryFromPrimitiveError(_)
        )
    }
}

/// An error raised while parsing the body of a message.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("Could not deserialize frame: {0}")]
    BadIncomingData(String),
    #[error("Could not serialize frame: {0}")]
    BadDataToSerialize(String),
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error(transparent)]
    CqlTypeError(#[from] CqlTypeError),
    #[error(transparent)]
    SerializeValuesError(#[from] SerializeValuesError),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::LowLevel(err.into())
    }
}

impl From<std::str::Utf8Error> for ParseError {
    fn from(err: std::str::Utf8Error) -> Self {
        ParseError::LowLevel(err.into())
    }
}

impl From<std::num::TryFromIntError> for ParseError {
    fn from(err: std::num::TryFromIntError) -> Self {
        ParseError::LowLevel(err.into())
    }
}

/// A low level deserialization error, raised while reading
/// the primitive building blocks of the protocol.
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// A column value did not match the type declared in the result metadata,
/// or the metadata named a type this client does not understand.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CqlTypeError {
    #[error("Unknown column type id: {0:#06x}")]
    UnknownTypeId(u16),
    #[error("Expected {expected} bytes for {typ} value, got {got}")]
    BadLength {
        typ: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Value of type {typ} is malformed: {reason}")]
    Malformed { typ: &'static str, reason: String },
}
