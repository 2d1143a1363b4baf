#![forbid(unsafe_code)]

//! `pipetrace` remote debug protocol codec.
//!
//! This crate is shared by the in-process debug server (`crates/pipetrace`) and by debug clients
//! such as `pipetrace-debug`. It knows nothing about the proxy itself.
//!
//! Wire format (all integer fields little-endian):
//!
//! ```text
//! 0               4               8               12
//! +---------------+---------------+---------------+
//! | opcode (i32)  |  len (u32)    | serial (u32)  |  header (12 bytes)
//! +---------------+---------------+---------------+
//! | payload (len bytes)                           |
//! +-----------------------------------------------+
//! ```
//!
//! Requests carry positive opcodes and a client-chosen `serial`. The reply to request `op` uses
//! opcode `-op` and echoes the serial. Unsolicited events use positive opcodes and serial 0.

pub mod client;
mod message;

use std::cmp::Ordering;

pub use client::{Client, ClientError};
pub use message::{
    decode_event, decode_reply, decode_request, encode_event, encode_reply, encode_request,
    ContextInfo, DecodeError, DrawRule, ErrorCode, Event, Opcode, Reply, Request, ShaderInfo,
    TextureData, TextureInfo,
};

pub const HEADER_LEN: usize = 12;

/// Draw blocker bits. Values are stable and shared with the proxy's `BlockFlags`.
pub const BLOCK_BEFORE: u32 = 1;
pub const BLOCK_AFTER: u32 = 2;
pub const BLOCK_RULE: u32 = 4;
pub const BLOCK_MASK: u32 = 7;

pub const DEFAULT_PORT: u16 = 13370;
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_payload_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: i32,
    pub serial: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame too short: {len} < {HEADER_LEN} (truncated header)")]
    FrameTooShort { len: usize },

    #[error("frame truncated payload: expected {expected} bytes, got {got}")]
    FrameTruncatedPayload { expected: usize, got: usize },

    #[error("frame has trailing bytes: {trailing}")]
    FrameTrailingBytes { trailing: usize },

    #[error("truncated frame stream (truncated header: {pending} pending bytes)")]
    TruncatedStreamHeader { pending: usize },

    #[error("truncated frame stream (truncated payload: {pending}/{payload_len} payload bytes)")]
    TruncatedStreamPayload { pending: usize, payload_len: usize },
}

/// The fixed 12-byte prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: i32,
    /// Payload length in bytes.
    pub len: u32,
    pub serial: u32,
}

impl Header {
    /// Header for a payload of `len` bytes, if `limits` allow it.
    pub fn for_payload(
        opcode: i32,
        serial: u32,
        len: usize,
        limits: &Limits,
    ) -> Result<Self, Error> {
        let max = limits.max_payload_len.min(u32::MAX as usize);
        if len > max {
            return Err(Error::FrameTooLarge { len, max });
        }
        Ok(Self {
            opcode,
            len: len as u32,
            serial,
        })
    }

    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        Self {
            opcode: i32::from_le_bytes(word(0)),
            len: u32::from_le_bytes(word(4)),
            serial: u32::from_le_bytes(word(8)),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..8].copy_from_slice(&self.len.to_le_bytes());
        out[8..12].copy_from_slice(&self.serial.to_le_bytes());
        out
    }

    /// The announced payload length, checked against `limits` before anything is allocated.
    pub fn payload_len(self, limits: &Limits) -> Result<usize, Error> {
        let len = self.len as usize;
        if len > limits.max_payload_len {
            return Err(Error::FrameTooLarge {
                len,
                max: limits.max_payload_len,
            });
        }
        Ok(len)
    }

    fn frame(self, payload: Vec<u8>) -> Frame {
        Frame {
            opcode: self.opcode,
            serial: self.serial,
            payload,
        }
    }
}

pub fn encode_frame_with_limits(
    opcode: i32,
    serial: u32,
    payload: &[u8],
    limits: &Limits,
) -> Result<Vec<u8>, Error> {
    let header = Header::for_payload(opcode, serial, payload.len(), limits)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame(opcode: i32, serial: u32, payload: &[u8]) -> Result<Vec<u8>, Error> {
    encode_frame_with_limits(opcode, serial, payload, &Limits::default())
}

/// Decode a buffer holding exactly one frame.
pub fn decode_frame_with_limits(buf: &[u8], limits: &Limits) -> Result<Frame, Error> {
    let head: &[u8; HEADER_LEN] = buf
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(Error::FrameTooShort { len: buf.len() })?;
    let header = Header::parse(head);
    let len = header.payload_len(limits)?;
    let payload = &buf[HEADER_LEN..];

    match payload.len().cmp(&len) {
        Ordering::Less => Err(Error::FrameTruncatedPayload {
            expected: HEADER_LEN.saturating_add(len),
            got: buf.len(),
        }),
        Ordering::Greater => Err(Error::FrameTrailingBytes {
            trailing: payload.len() - len,
        }),
        Ordering::Equal => Ok(header.frame(payload.to_vec())),
    }
}

pub fn decode_frame(buf: &[u8]) -> Result<Frame, Error> {
    decode_frame_with_limits(buf, &Limits::default())
}

/// Incremental frame reader.
///
/// Chunks may split frames anywhere; the debug server feeds it from reads that time out every
/// poll interval. A payload buffer is only allocated once its header has passed the limits.
#[derive(Debug, Clone)]
pub struct FrameParser {
    limits: Limits,
    header: [u8; HEADER_LEN],
    filled: usize,
    pending: Option<Pending>,
}

/// A frame whose header is complete and whose payload is still arriving.
#[derive(Debug, Clone)]
struct Pending {
    header: Header,
    payload: Vec<u8>,
}

impl Pending {
    fn remaining(&self) -> usize {
        self.header.len as usize - self.payload.len()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            header: [0u8; HEADER_LEN],
            filled: 0,
            pending: None,
        }
    }

    /// Feed `chunk`, returning every frame it completes.
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>, Error> {
        let mut frames = Vec::new();
        loop {
            let Some(pending) = self.pending.as_mut() else {
                let take = (HEADER_LEN - self.filled).min(chunk.len());
                self.header[self.filled..self.filled + take].copy_from_slice(&chunk[..take]);
                self.filled += take;
                chunk = &chunk[take..];
                if self.filled < HEADER_LEN {
                    break;
                }

                self.filled = 0;
                let header = Header::parse(&self.header);
                let len = header.payload_len(&self.limits)?;
                self.pending = Some(Pending {
                    header,
                    payload: Vec::with_capacity(len),
                });
                continue;
            };

            let take = pending.remaining().min(chunk.len());
            pending.payload.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if pending.remaining() > 0 {
                break;
            }
            if let Some(done) = self.pending.take() {
                frames.push(done.header.frame(done.payload));
            }
        }
        Ok(frames)
    }

    /// Reports whether the stream ended on a frame boundary.
    pub fn finish(&self) -> Result<(), Error> {
        match &self.pending {
            None if self.filled == 0 => Ok(()),
            None => Err(Error::TruncatedStreamHeader {
                pending: self.filled,
            }),
            Some(pending) => Err(Error::TruncatedStreamPayload {
                pending: pending.payload.len(),
                payload_len: pending.header.len as usize,
            }),
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
