//! # Message Envelopes
//!
//! Streaming Connect calls and every gRPC/gRPC-Web call frame each message as:
//!
//! ```text
//! +--------+----------------------+-----------------+
//! | flags  | length (u32, BE)     | payload         |
//! | 1 byte | 4 bytes              | `length` bytes  |
//! +--------+----------------------+-----------------+
//! ```
//!
//! Bit `0x01` of the flags marks a compressed payload. The other bits are protocol
//! specific: `0x02` is the Connect end-of-stream frame, `0x80` the gRPC-Web trailers
//! frame.
use crate::compression::{CompressionError, CompressionPool};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 5;
pub const COMPRESSED_FLAG: u8 = 0b0000_0001;

#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
    #[error("incomplete envelope: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("message of {len} bytes does not fit an envelope")]
    TooLarge { len: usize },
    #[error("received a compressed message but no compression was negotiated")]
    MissingCompression,
    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Frames `payload`, compressing it when a pool and a threshold are given and the
/// payload reaches the threshold.
pub fn pack(
    payload: &[u8],
    pool: Option<&dyn CompressionPool>,
    min_bytes: Option<usize>,
) -> Result<Bytes, EnvelopeError> {
    match (pool, min_bytes) {
        (Some(pool), Some(min_bytes)) if payload.len() >= min_bytes => {
            let compressed = pool.compress(payload)?;
            pack_with_flags(&compressed, COMPRESSED_FLAG)
        }
        _ => pack_with_flags(payload, 0),
    }
}

/// Frames `payload` as-is with the given flags.
pub fn pack_with_flags(payload: &[u8], flags: u8) -> Result<Bytes, EnvelopeError> {
    let len = frame_len(payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn frame_len(len: usize) -> Result<u32, EnvelopeError> {
    u32::try_from(len).map_err(|_| EnvelopeError::TooLarge { len })
}

/// Reads the first envelope of `buf`.
///
/// # Returns
///
/// * `Ok((0, empty))` - `buf` is empty.
/// * `Ok((flags, payload))` - The payload, decompressed when the compressed flag is set.
/// * `Err(EnvelopeError)` - The frame is truncated, or compressed without a pool.
pub fn unpack(
    buf: &[u8],
    pool: Option<&dyn CompressionPool>,
) -> Result<(u8, Bytes), EnvelopeError> {
    unpack_limited(buf, pool, None)
}

pub(crate) fn unpack_limited(
    buf: &[u8],
    pool: Option<&dyn CompressionPool>,
    read_max_bytes: Option<usize>,
) -> Result<(u8, Bytes), EnvelopeError> {
    if buf.is_empty() {
        return Ok((0, Bytes::new()));
    }
    if buf.len() < HEADER_LEN {
        return Err(EnvelopeError::Truncated {
            expected: HEADER_LEN,
            found: buf.len(),
        });
    }

    let mut header = &buf[..HEADER_LEN];
    let flags = header.get_u8();
    let len = header.get_u32() as usize;
    let body = &buf[HEADER_LEN..];
    if body.len() < len {
        return Err(EnvelopeError::Truncated {
            expected: len,
            found: body.len(),
        });
    }
    let payload = &body[..len];

    if flags & COMPRESSED_FLAG == 0 {
        return Ok((flags, Bytes::copy_from_slice(payload)));
    }
    let pool = pool.ok_or(EnvelopeError::MissingCompression)?;
    Ok((flags, pool.decompress(payload, read_max_bytes)?))
}

/// Splits a byte stream into complete envelopes.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buffer: BytesMut,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, header included, or `None` if more data is needed.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if self.buffer.len() < HEADER_LEN + len {
            return None;
        }
        Some(self.buffer.split_to(HEADER_LEN + len).freeze())
    }

    /// Length of the next frame's payload, once its header has arrived.
    pub fn pending_len(&self) -> Option<usize> {
        (self.buffer.len() >= HEADER_LEN).then(|| {
            u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize
        })
    }

    /// Bytes received that do not yet form a complete frame.
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }
}
