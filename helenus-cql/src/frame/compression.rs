//! Frame body compression.

use super::frame_errors::FrameError;
use super::MAX_FRAME_BODY_SIZE;
use bytes::{Buf, BufMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fmt::Display;
use std::io::{Read, Write};
use std::str::FromStr;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
    /// Gzip (deflate) compression, offered by legacy-compatible nodes.
    Gzip,
}

impl Compression {
    /// Name under which the algorithm is listed in SUPPORTED and requested in STARTUP.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
            Compression::Gzip => "gzip",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown compression algorithm: {0}")]
pub struct UnknownCompression(String);

impl FromStr for Compression {
    type Err = UnknownCompression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lz4" => Ok(Compression::Lz4),
            "snappy" => Ok(Compression::Snappy),
            "gzip" => Ok(Compression::Gzip),
            other => Err(UnknownCompression(other.to_owned())),
        }
    }
}

pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(out, flate2::Compression::default());
            encoder
                .write_all(uncomp_body)
                .map_err(|_| FrameError::FrameCompression)?;
            encoder.finish().map_err(|_| FrameError::FrameCompression)?;
            Ok(())
        }
    }
}

/// Inflates a frame body. Output larger than [`MAX_FRAME_BODY_SIZE`] is
/// rejected like any other malformed payload.
pub fn decompress(comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    decompress_limited(comp_body, compression, MAX_FRAME_BODY_SIZE)
}

fn decompress_limited(
    mut comp_body: &[u8],
    compression: Compression,
    limit: usize,
) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            if uncomp_len > limit {
                return Err(FrameError::FrameDecompression);
            }
            lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|_| FrameError::FrameDecompression)
        }
        Compression::Snappy => {
            let uncomp_len = snap::raw::decompress_len(comp_body)
                .map_err(|_| FrameError::FrameDecompression)?;
            if uncomp_len > limit {
                return Err(FrameError::FrameDecompression);
            }
            snap::raw::Decoder::new()
                .decompress_vec(comp_body)
                .map_err(|_| FrameError::FrameDecompression)
        }
        Compression::Gzip => {
            let mut uncomp_body = Vec::with_capacity(comp_body.len() * 2);
            GzDecoder::new(comp_body)
                .take(limit as u64 + 1)
                .read_to_end(&mut uncomp_body)
                .map_err(|_| FrameError::FrameDecompression)?;
            if uncomp_body.len() > limit {
                return Err(FrameError::FrameDecompression);
            }
            Ok(uncomp_body)
        }
    }
}
