//! Framing of the CQL native protocol, version 4.
//!
//! Every message travels in a frame made of a fixed 9-byte header
//! (version, flags, stream id, opcode, body length) followed by the body.
//! Requests are built with [`SerializedRequest`], responses are read
//! either straight from an [`AsyncRead`] with [`read_response_frame`] or
//! reassembled from arbitrary chunks of bytes with [`decode_response_frame`].

pub mod compression;
pub mod frame_errors;
pub mod request;
pub mod response;
pub mod types;
pub mod value;

use crate::frame::frame_errors::{FrameError, ParseError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::collections::HashMap;
use std::convert::TryFrom;

pub use compression::Compression;
use request::{RequestOpcode, SerializableRequest};
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 9;

/// Bodies above this size are rejected before any allocation happens.
pub const MAX_FRAME_BODY_SIZE: usize = 256 * 1024 * 1024;

const PROTOCOL_VERSION: u8 = 0x04;
const RESPONSE_BIT: u8 = 0x80;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// A request frame, ready to be written to the socket once its
/// stream id is assigned.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compression::compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = PROTOCOL_VERSION;
        data[1] = flags;
        // Leave space for the stream number
        data[4] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn is_compressed(&self) -> bool {
        self.data[1] & FLAG_COMPRESSION != 0
    }
}

/// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

impl FrameParams {
    pub const fn for_request(&self) -> FrameParams {
        Self {
            version: self.version & !RESPONSE_BIT,
            ..*self
        }
    }

    pub const fn for_response(&self) -> FrameParams {
        Self {
            version: RESPONSE_BIT | (self.version & !RESPONSE_BIT),
            ..*self
        }
    }
}

/// Writes a complete frame with the given header fields and (already
/// compressed, if the flags say so) body.
pub fn encode_frame(params: FrameParams, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.put_u8(params.version);
    data.put_u8(params.flags);
    data.put_i16(params.stream);
    data.put_u8(opcode);
    data.put_u32(body.len() as u32);
    data.extend_from_slice(body);
    data
}

#[derive(Clone, Copy)]
enum Direction {
    Request,
    Response,
}

fn parse_header(
    mut buf: &[u8],
    direction: Direction,
) -> Result<(FrameParams, u8, usize), FrameError> {
    let version = buf.get_u8();
    match direction {
        Direction::Response if version & RESPONSE_BIT == 0 => {
            return Err(FrameError::FrameFromClient)
        }
        Direction::Request if version & RESPONSE_BIT != 0 => {
            return Err(FrameError::FrameFromServer)
        }
        _ => {}
    }
    if version & !RESPONSE_BIT != PROTOCOL_VERSION {
        return Err(FrameError::VersionNotSupported(version & !RESPONSE_BIT));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();
    let opcode = buf.get_u8();

    let length = buf.get_u32() as usize;
    if length > MAX_FRAME_BODY_SIZE {
        return Err(FrameError::FrameTooLarge(length, MAX_FRAME_BODY_SIZE));
    }

    let params = FrameParams {
        version,
        flags,
        stream,
    };
    Ok((params, opcode, length))
}

fn decode_frame(
    buf: &mut BytesMut,
    direction: Direction,
) -> Result<Option<(FrameParams, u8, Bytes)>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let (params, opcode, length) = parse_header(&buf[..HEADER_SIZE], direction)?;
    if buf.len() < HEADER_SIZE + length {
        buf.reserve(HEADER_SIZE + length - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let body = buf.split_to(length).freeze();
    Ok(Some((params, opcode, body)))
}

/// Takes one response frame off the front of `buf`.
///
/// Returns `Ok(None)` without consuming anything while the header or the
/// body is still incomplete; the caller appends more bytes and retries.
pub fn decode_response_frame(
    buf: &mut BytesMut,
) -> Result<Option<(FrameParams, ResponseOpcode, Bytes)>, FrameError> {
    match decode_frame(buf, Direction::Response)? {
        Some((params, opcode, body)) => {
            let opcode = ResponseOpcode::try_from(opcode)?;
            Ok(Some((params, opcode, body)))
        }
        None => Ok(None),
    }
}

/// Request counterpart of [`decode_response_frame`], used by servers and test peers.
pub fn decode_request_frame(
    buf: &mut BytesMut,
) -> Result<Option<(FrameParams, RequestOpcode, Bytes)>, FrameError> {
    match decode_frame(buf, Direction::Request)? {
        Some((params, opcode, body)) => {
            let opcode = RequestOpcode::try_from(opcode)?;
            Ok(Some((params, opcode, body)))
        }
        None => Ok(None),
    }
}

async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    direction: Direction,
) -> Result<(FrameParams, u8, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let (params, opcode, length) = parse_header(&raw_header[..], direction)?;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((params, opcode, raw_body.into_inner().into()))
}

pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let (params, opcode, body) = read_frame(reader, Direction::Response).await?;
    Ok((params, ResponseOpcode::try_from(opcode)?, body))
}

pub async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, RequestOpcode, Bytes), FrameError> {
    let (params, opcode, body) = read_frame(reader, Direction::Request).await?;
    Ok((params, RequestOpcode::try_from(opcode)?, body))
}

#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
}

/// Decompresses the body if the response says it is compressed and strips
/// the optional tracing id, warnings and custom payload in front of it.
///
/// Whether the body is compressed is decided by the server's flag alone,
/// regardless of what the request asked for.
pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = compression::decompress(&body, compression)?.into();
        } else {
            return Err(FrameError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf).map_err(ParseError::from)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf).map_err(ParseError::from)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf).map_err(ParseError::from)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
