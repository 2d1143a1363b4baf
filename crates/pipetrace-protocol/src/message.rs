//! Typed debug protocol messages.
//!
//! Payloads are little-endian. Strings are a `u32` byte length followed by UTF-8 bytes, except in
//! `ERROR` replies which use a `u16` length. Identity 0 means "none" everywhere.

use crate::{encode_frame_with_limits, Error, Frame, Limits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ping,
    TextureList,
    TextureInfo,
    TextureRead,
    ShaderList,
    ShaderInfo,
    ShaderDisable,
    ShaderReplace,
    ContextList,
    ContextInfo,
    ContextDrawBlock,
    ContextDrawStep,
    ContextDrawUnblock,
    ContextDrawRule,
    ContextFlush,
    ContextDrawBlocked,
}

// Numeric values are stable and must not be changed once released.
const OP_PING: i32 = 1;
const OP_TEXTURE_LIST: i32 = 256;
const OP_TEXTURE_INFO: i32 = 257;
const OP_TEXTURE_READ: i32 = 259;
const OP_SHADER_LIST: i32 = 512;
const OP_SHADER_INFO: i32 = 513;
const OP_SHADER_DISABLE: i32 = 514;
const OP_SHADER_REPLACE: i32 = 515;
const OP_CONTEXT_LIST: i32 = 768;
const OP_CONTEXT_INFO: i32 = 769;
const OP_CONTEXT_DRAW_BLOCK: i32 = 770;
const OP_CONTEXT_DRAW_STEP: i32 = 771;
const OP_CONTEXT_DRAW_UNBLOCK: i32 = 772;
const OP_CONTEXT_DRAW_RULE: i32 = 773;
const OP_CONTEXT_FLUSH: i32 = 774;
const OP_CONTEXT_DRAW_BLOCKED: i32 = 775;

pub const OP_ERROR_REPLY: i32 = -2;

impl Opcode {
    pub fn as_i32(self) -> i32 {
        match self {
            Opcode::Ping => OP_PING,
            Opcode::TextureList => OP_TEXTURE_LIST,
            Opcode::TextureInfo => OP_TEXTURE_INFO,
            Opcode::TextureRead => OP_TEXTURE_READ,
            Opcode::ShaderList => OP_SHADER_LIST,
            Opcode::ShaderInfo => OP_SHADER_INFO,
            Opcode::ShaderDisable => OP_SHADER_DISABLE,
            Opcode::ShaderReplace => OP_SHADER_REPLACE,
            Opcode::ContextList => OP_CONTEXT_LIST,
            Opcode::ContextInfo => OP_CONTEXT_INFO,
            Opcode::ContextDrawBlock => OP_CONTEXT_DRAW_BLOCK,
            Opcode::ContextDrawStep => OP_CONTEXT_DRAW_STEP,
            Opcode::ContextDrawUnblock => OP_CONTEXT_DRAW_UNBLOCK,
            Opcode::ContextDrawRule => OP_CONTEXT_DRAW_RULE,
            Opcode::ContextFlush => OP_CONTEXT_FLUSH,
            Opcode::ContextDrawBlocked => OP_CONTEXT_DRAW_BLOCKED,
        }
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            OP_PING => Opcode::Ping,
            OP_TEXTURE_LIST => Opcode::TextureList,
            OP_TEXTURE_INFO => Opcode::TextureInfo,
            OP_TEXTURE_READ => Opcode::TextureRead,
            OP_SHADER_LIST => Opcode::ShaderList,
            OP_SHADER_INFO => Opcode::ShaderInfo,
            OP_SHADER_DISABLE => Opcode::ShaderDisable,
            OP_SHADER_REPLACE => Opcode::ShaderReplace,
            OP_CONTEXT_LIST => Opcode::ContextList,
            OP_CONTEXT_INFO => Opcode::ContextInfo,
            OP_CONTEXT_DRAW_BLOCK => Opcode::ContextDrawBlock,
            OP_CONTEXT_DRAW_STEP => Opcode::ContextDrawStep,
            OP_CONTEXT_DRAW_UNBLOCK => Opcode::ContextDrawUnblock,
            OP_CONTEXT_DRAW_RULE => Opcode::ContextDrawRule,
            OP_CONTEXT_FLUSH => Opcode::ContextFlush,
            OP_CONTEXT_DRAW_BLOCKED => Opcode::ContextDrawBlocked,
            _ => return None,
        })
    }

    /// Opcode used by the reply to this request.
    pub fn reply_opcode(self) -> i32 {
        -self.as_i32()
    }
}

/// Error code carried inside `ERROR` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// The request payload did not decode.
    pub const PROTOCOL: Self = Self(1);
    pub const UNKNOWN_OPCODE: Self = Self(2);
    /// The request referenced a resource that is not (or no longer) live.
    pub const NOT_FOUND: Self = Self(3);
    /// The backend refused the operation (shader compile, texture map, ...).
    pub const BACKEND: Self = Self(4);
    pub const UNSUPPORTED: Self = Self(5);
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            ErrorCode::PROTOCOL => "protocol",
            ErrorCode::UNKNOWN_OPCODE => "unknown-opcode",
            ErrorCode::NOT_FOUND => "not-found",
            ErrorCode::BACKEND => "backend",
            ErrorCode::UNSUPPORTED => "unsupported",
            ErrorCode(other) => return write!(f, "error-{other}"),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawRule {
    pub vertex: u64,
    pub fragment: u64,
    pub texture: u64,
    pub surface: u64,
    pub block: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    TextureList,
    TextureInfo {
        texture: u64,
    },
    TextureRead {
        texture: u64,
        face: u32,
        level: u32,
        zslice: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    ShaderList {
        context: u64,
    },
    ShaderInfo {
        context: u64,
        shader: u64,
    },
    ShaderDisable {
        context: u64,
        shader: u64,
        disable: bool,
    },
    /// `source: None` restores the original program.
    ShaderReplace {
        context: u64,
        shader: u64,
        source: Option<String>,
    },
    ContextList,
    ContextInfo {
        context: u64,
    },
    ContextDrawBlock {
        context: u64,
        block: u32,
    },
    ContextDrawStep {
        context: u64,
        step: u32,
    },
    ContextDrawUnblock {
        context: u64,
        unblock: u32,
    },
    ContextDrawRule {
        context: u64,
        rule: DrawRule,
    },
    ContextFlush {
        context: u64,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Ping => Opcode::Ping,
            Request::TextureList => Opcode::TextureList,
            Request::TextureInfo { .. } => Opcode::TextureInfo,
            Request::TextureRead { .. } => Opcode::TextureRead,
            Request::ShaderList { .. } => Opcode::ShaderList,
            Request::ShaderInfo { .. } => Opcode::ShaderInfo,
            Request::ShaderDisable { .. } => Opcode::ShaderDisable,
            Request::ShaderReplace { .. } => Opcode::ShaderReplace,
            Request::ContextList => Opcode::ContextList,
            Request::ContextInfo { .. } => Opcode::ContextInfo,
            Request::ContextDrawBlock { .. } => Opcode::ContextDrawBlock,
            Request::ContextDrawStep { .. } => Opcode::ContextDrawStep,
            Request::ContextDrawUnblock { .. } => Opcode::ContextDrawUnblock,
            Request::ContextDrawRule { .. } => Opcode::ContextDrawRule,
            Request::ContextFlush { .. } => Opcode::ContextFlush,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureInfo {
    pub target: u32,
    pub format: u32,
    /// `[width, height, depth]` for each mip level, level 0 first.
    pub levels: Vec<[u32; 3]>,
    pub block_width: u32,
    pub block_height: u32,
    pub block_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub bind: u32,
    pub usage: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureData {
    pub format: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub block_size: u32,
    pub stride: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderInfo {
    pub stage: u32,
    pub disabled: bool,
    pub original: String,
    pub replaced: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextInfo {
    pub vertex: u64,
    pub fragment: u64,
    pub fragment_textures: Vec<u64>,
    pub vertex_textures: Vec<u64>,
    pub cbufs: Vec<u64>,
    pub zsbuf: u64,
    pub blocker: u32,
    pub blocked: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong,
    /// Empty acknowledgement for requests that only have side effects.
    Ack(Opcode),
    TextureList(Vec<u64>),
    TextureInfo(TextureInfo),
    TextureRead(TextureData),
    ShaderList(Vec<u64>),
    ShaderInfo(ShaderInfo),
    ContextList(Vec<u64>),
    ContextInfo(ContextInfo),
    Error { code: ErrorCode, message: String },
}

impl Reply {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Reply::Error {
            code,
            message: message.into(),
        }
    }

    fn opcode(&self) -> i32 {
        match self {
            Reply::Pong => Opcode::Ping.reply_opcode(),
            Reply::Ack(op) => op.reply_opcode(),
            Reply::TextureList(_) => Opcode::TextureList.reply_opcode(),
            Reply::TextureInfo(_) => Opcode::TextureInfo.reply_opcode(),
            Reply::TextureRead(_) => Opcode::TextureRead.reply_opcode(),
            Reply::ShaderList(_) => Opcode::ShaderList.reply_opcode(),
            Reply::ShaderInfo(_) => Opcode::ShaderInfo.reply_opcode(),
            Reply::ContextList(_) => Opcode::ContextList.reply_opcode(),
            Reply::ContextInfo(_) => Opcode::ContextInfo.reply_opcode(),
            Reply::Error { .. } => OP_ERROR_REPLY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    DrawBlocked { context: u64, blocked: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of payload")]
    UnexpectedEof,
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("unknown opcode {0}")]
    UnknownOpcode(i32),
    #[error("payload has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),
}

pub fn encode_request(
    serial: u32,
    request: &Request,
    limits: &Limits,
) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match request {
        Request::Ping | Request::TextureList | Request::ContextList => {}
        Request::TextureInfo { texture } => push_u64(&mut out, *texture),
        Request::TextureRead {
            texture,
            face,
            level,
            zslice,
            x,
            y,
            width,
            height,
        } => {
            push_u64(&mut out, *texture);
            for v in [face, level, zslice, x, y, width, height] {
                push_u32(&mut out, *v);
            }
        }
        Request::ShaderList { context } => push_u64(&mut out, *context),
        Request::ShaderInfo { context, shader } => {
            push_u64(&mut out, *context);
            push_u64(&mut out, *shader);
        }
        Request::ShaderDisable {
            context,
            shader,
            disable,
        } => {
            push_u64(&mut out, *context);
            push_u64(&mut out, *shader);
            out.push(u8::from(*disable));
        }
        Request::ShaderReplace {
            context,
            shader,
            source,
        } => {
            push_u64(&mut out, *context);
            push_u64(&mut out, *shader);
            push_opt_str(&mut out, source.as_deref());
        }
        Request::ContextInfo { context } | Request::ContextFlush { context } => {
            push_u64(&mut out, *context)
        }
        Request::ContextDrawBlock { context, block: v }
        | Request::ContextDrawStep { context, step: v }
        | Request::ContextDrawUnblock {
            context,
            unblock: v,
        } => {
            push_u64(&mut out, *context);
            push_u32(&mut out, *v);
        }
        Request::ContextDrawRule { context, rule } => {
            push_u64(&mut out, *context);
            push_u64(&mut out, rule.vertex);
            push_u64(&mut out, rule.fragment);
            push_u64(&mut out, rule.texture);
            push_u64(&mut out, rule.surface);
            push_u32(&mut out, rule.block);
        }
    }
    encode_frame_with_limits(request.opcode().as_i32(), serial, &out, limits)
}

pub fn decode_request(frame: &Frame) -> Result<Request, DecodeError> {
    let op = Opcode::from_i32(frame.opcode).ok_or(DecodeError::UnknownOpcode(frame.opcode))?;
    let mut r = Reader::new(&frame.payload);
    let request = match op {
        Opcode::Ping => Request::Ping,
        Opcode::TextureList => Request::TextureList,
        Opcode::ContextList => Request::ContextList,
        Opcode::TextureInfo => Request::TextureInfo {
            texture: r.read_u64()?,
        },
        Opcode::TextureRead => Request::TextureRead {
            texture: r.read_u64()?,
            face: r.read_u32()?,
            level: r.read_u32()?,
            zslice: r.read_u32()?,
            x: r.read_u32()?,
            y: r.read_u32()?,
            width: r.read_u32()?,
            height: r.read_u32()?,
        },
        Opcode::ShaderList => Request::ShaderList {
            context: r.read_u64()?,
        },
        Opcode::ShaderInfo => Request::ShaderInfo {
            context: r.read_u64()?,
            shader: r.read_u64()?,
        },
        Opcode::ShaderDisable => Request::ShaderDisable {
            context: r.read_u64()?,
            shader: r.read_u64()?,
            disable: r.read_bool()?,
        },
        Opcode::ShaderReplace => Request::ShaderReplace {
            context: r.read_u64()?,
            shader: r.read_u64()?,
            source: r.read_opt_str("shader source")?,
        },
        Opcode::ContextInfo => Request::ContextInfo {
            context: r.read_u64()?,
        },
        Opcode::ContextDrawBlock => Request::ContextDrawBlock {
            context: r.read_u64()?,
            block: r.read_u32()?,
        },
        Opcode::ContextDrawStep => Request::ContextDrawStep {
            context: r.read_u64()?,
            step: r.read_u32()?,
        },
        Opcode::ContextDrawUnblock => Request::ContextDrawUnblock {
            context: r.read_u64()?,
            unblock: r.read_u32()?,
        },
        Opcode::ContextDrawRule => Request::ContextDrawRule {
            context: r.read_u64()?,
            rule: DrawRule {
                vertex: r.read_u64()?,
                fragment: r.read_u64()?,
                texture: r.read_u64()?,
                surface: r.read_u64()?,
                block: r.read_u32()?,
            },
        },
        Opcode::ContextFlush => Request::ContextFlush {
            context: r.read_u64()?,
        },
        // Events are server -> client only.
        Opcode::ContextDrawBlocked => return Err(DecodeError::UnknownOpcode(frame.opcode)),
    };
    r.finish()?;
    Ok(request)
}

pub fn encode_reply(serial: u32, reply: &Reply, limits: &Limits) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match reply {
        Reply::Pong | Reply::Ack(_) => {}
        Reply::TextureList(ids) | Reply::ShaderList(ids) | Reply::ContextList(ids) => {
            push_ids(&mut out, ids)
        }
        Reply::TextureInfo(info) => {
            push_u32(&mut out, info.target);
            push_u32(&mut out, info.format);
            push_u32(&mut out, info.levels.len() as u32);
            for [w, h, d] in &info.levels {
                push_u32(&mut out, *w);
                push_u32(&mut out, *h);
                push_u32(&mut out, *d);
            }
            push_u32(&mut out, info.block_width);
            push_u32(&mut out, info.block_height);
            push_u32(&mut out, info.block_size);
            push_u32(&mut out, info.last_level);
            push_u32(&mut out, info.nr_samples);
            push_u32(&mut out, info.bind);
            push_u32(&mut out, info.usage);
        }
        Reply::TextureRead(data) => {
            push_u32(&mut out, data.format);
            push_u32(&mut out, data.block_width);
            push_u32(&mut out, data.block_height);
            push_u32(&mut out, data.block_size);
            push_u32(&mut out, data.stride);
            push_u32(&mut out, data.data.len() as u32);
            out.extend_from_slice(&data.data);
        }
        Reply::ShaderInfo(info) => {
            push_u32(&mut out, info.stage);
            out.push(u8::from(info.disabled));
            push_str(&mut out, &info.original);
            push_opt_str(&mut out, info.replaced.as_deref());
        }
        Reply::ContextInfo(info) => {
            push_u64(&mut out, info.vertex);
            push_u64(&mut out, info.fragment);
            push_ids(&mut out, &info.fragment_textures);
            push_ids(&mut out, &info.vertex_textures);
            push_ids(&mut out, &info.cbufs);
            push_u64(&mut out, info.zsbuf);
            push_u32(&mut out, info.blocker);
            push_u32(&mut out, info.blocked);
        }
        Reply::Error { code, message } => {
            // code (u16) | msg_len (u16) | msg, truncated on a char boundary.
            let mut msg_len = message.len().min(u16::MAX as usize);
            while msg_len > 0 && !message.is_char_boundary(msg_len) {
                msg_len -= 1;
            }
            push_u16(&mut out, code.0);
            push_u16(&mut out, msg_len as u16);
            out.extend_from_slice(&message.as_bytes()[..msg_len]);
        }
    }
    encode_frame_with_limits(reply.opcode(), serial, &out, limits)
}

pub fn decode_reply(frame: &Frame) -> Result<Reply, DecodeError> {
    if frame.opcode == OP_ERROR_REPLY {
        let mut r = Reader::new(&frame.payload);
        let code = ErrorCode(r.read_u16()?);
        let len = r.read_u16()? as usize;
        let msg = r.read_bytes(len)?;
        let message = core::str::from_utf8(msg)
            .map_err(|_| DecodeError::InvalidUtf8("error message"))?
            .to_owned();
        r.finish()?;
        return Ok(Reply::Error { code, message });
    }

    let op = frame
        .opcode
        .checked_neg()
        .and_then(Opcode::from_i32)
        .ok_or(DecodeError::UnknownOpcode(frame.opcode))?;
    let mut r = Reader::new(&frame.payload);
    let reply = match op {
        Opcode::Ping => Reply::Pong,
        Opcode::TextureList => Reply::TextureList(r.read_ids()?),
        Opcode::ShaderList => Reply::ShaderList(r.read_ids()?),
        Opcode::ContextList => Reply::ContextList(r.read_ids()?),
        Opcode::TextureInfo => {
            let target = r.read_u32()?;
            let format = r.read_u32()?;
            let count = r.read_u32()? as usize;
            let mut levels = Vec::with_capacity(count.min(r.remaining() / 12));
            for _ in 0..count {
                levels.push([r.read_u32()?, r.read_u32()?, r.read_u32()?]);
            }
            Reply::TextureInfo(TextureInfo {
                target,
                format,
                levels,
                block_width: r.read_u32()?,
                block_height: r.read_u32()?,
                block_size: r.read_u32()?,
                last_level: r.read_u32()?,
                nr_samples: r.read_u32()?,
                bind: r.read_u32()?,
                usage: r.read_u32()?,
            })
        }
        Opcode::TextureRead => {
            let format = r.read_u32()?;
            let block_width = r.read_u32()?;
            let block_height = r.read_u32()?;
            let block_size = r.read_u32()?;
            let stride = r.read_u32()?;
            let len = r.read_u32()? as usize;
            let data = r.read_bytes(len)?.to_vec();
            Reply::TextureRead(TextureData {
                format,
                block_width,
                block_height,
                block_size,
                stride,
                data,
            })
        }
        Opcode::ShaderInfo => Reply::ShaderInfo(ShaderInfo {
            stage: r.read_u32()?,
            disabled: r.read_bool()?,
            original: r.read_str("shader original")?,
            replaced: r.read_opt_str("shader replacement")?,
        }),
        Opcode::ContextInfo => Reply::ContextInfo(ContextInfo {
            vertex: r.read_u64()?,
            fragment: r.read_u64()?,
            fragment_textures: r.read_ids()?,
            vertex_textures: r.read_ids()?,
            cbufs: r.read_ids()?,
            zsbuf: r.read_u64()?,
            blocker: r.read_u32()?,
            blocked: r.read_u32()?,
        }),
        Opcode::ContextDrawBlocked => return Err(DecodeError::UnknownOpcode(frame.opcode)),
        other => Reply::Ack(other),
    };
    r.finish()?;
    Ok(reply)
}

pub fn encode_event(event: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(crate::HEADER_LEN + 12);
    match event {
        Event::DrawBlocked { context, blocked } => {
            let mut payload = Vec::with_capacity(12);
            push_u64(&mut payload, *context);
            push_u32(&mut payload, *blocked);
            out.extend_from_slice(&OP_CONTEXT_DRAW_BLOCKED.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&payload);
        }
    }
    out
}

pub fn decode_event(frame: &Frame) -> Result<Event, DecodeError> {
    if frame.opcode != OP_CONTEXT_DRAW_BLOCKED {
        return Err(DecodeError::UnknownOpcode(frame.opcode));
    }
    let mut r = Reader::new(&frame.payload);
    let event = Event::DrawBlocked {
        context: r.read_u64()?,
        blocked: r.read_u32()?,
    };
    r.finish()?;
    Ok(event)
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    push_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn push_opt_str(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            out.push(1);
            push_str(out, s);
        }
        None => out.push(0),
    }
}

fn push_ids(out: &mut Vec<u8>, ids: &[u64]) {
    push_u32(out, ids.len() as u32);
    for id in ids {
        push_u64(out, *id);
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    fn read_str(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(context))
    }

    fn read_opt_str(&mut self, context: &'static str) -> Result<Option<String>, DecodeError> {
        if self.read_bool()? {
            Ok(Some(self.read_str(context)?))
        } else {
            Ok(None)
        }
    }

    fn read_ids(&mut self) -> Result<Vec<u64>, DecodeError> {
        let count = self.read_u32()? as usize;
        // Untrusted count; cap the preallocation by what the payload can hold.
        let mut ids = Vec::with_capacity(count.min(self.remaining() / 8));
        for _ in 0..count {
            ids.push(self.read_u64()?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_frame;

    fn request_frame(request: &Request) -> Frame {
        decode_frame(&encode_request(9, request, &Limits::default()).unwrap()).unwrap()
    }

    #[test]
    fn every_request_opcode_maps_back_to_itself() {
        for raw in [1, 256, 257, 259, 512, 513, 514, 515, 768, 769, 770, 771, 772, 773, 774, 775] {
            let op = Opcode::from_i32(raw).unwrap();
            assert_eq!(op.as_i32(), raw);
            assert_eq!(op.reply_opcode(), -raw);
        }
        assert_eq!(Opcode::from_i32(258), None);
        assert_eq!(Opcode::from_i32(0), None);
    }

    #[test]
    fn draw_rule_request_decodes_field_by_field() {
        let request = Request::ContextDrawRule {
            context: 3,
            rule: DrawRule {
                vertex: 0,
                fragment: 11,
                texture: 0,
                surface: 42,
                block: crate::BLOCK_BEFORE,
            },
        };
        let frame = request_frame(&request);
        assert_eq!(frame.serial, 9);
        assert_eq!(frame.payload.len(), 8 * 5 + 4);
        assert_eq!(decode_request(&frame).unwrap(), request);
    }

    #[test]
    fn shader_replace_distinguishes_restore_from_empty_source() {
        let restore = Request::ShaderReplace {
            context: 1,
            shader: 2,
            source: None,
        };
        let empty = Request::ShaderReplace {
            context: 1,
            shader: 2,
            source: Some(String::new()),
        };
        assert_eq!(decode_request(&request_frame(&restore)).unwrap(), restore);
        assert_eq!(decode_request(&request_frame(&empty)).unwrap(), empty);
    }

    #[test]
    fn request_with_trailing_bytes_is_rejected() {
        let mut frame = request_frame(&Request::ContextInfo { context: 1 });
        frame.payload.push(0);
        assert_eq!(decode_request(&frame), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn unknown_and_event_opcodes_are_not_requests() {
        let frame = Frame {
            opcode: 4242,
            serial: 1,
            payload: Vec::new(),
        };
        assert_eq!(decode_request(&frame), Err(DecodeError::UnknownOpcode(4242)));

        let frame = Frame {
            opcode: 775,
            serial: 1,
            payload: vec![0; 12],
        };
        assert_eq!(decode_request(&frame), Err(DecodeError::UnknownOpcode(775)));
    }

    #[test]
    fn ack_replies_carry_the_request_opcode() {
        let bytes = encode_reply(5, &Reply::Ack(Opcode::ContextDrawStep), &Limits::default())
            .unwrap();
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.opcode, -771);
        assert_eq!(frame.serial, 5);
        assert_eq!(
            decode_reply(&frame).unwrap(),
            Reply::Ack(Opcode::ContextDrawStep)
        );
    }

    #[test]
    fn error_reply_message_is_truncated_on_char_boundary() {
        let message = "é".repeat(40_000);
        let bytes = encode_reply(
            1,
            &Reply::error(ErrorCode::NOT_FOUND, message),
            &Limits::default(),
        )
        .unwrap();
        let frame = decode_frame(&bytes).unwrap();
        match decode_reply(&frame).unwrap() {
            Reply::Error { code, message } => {
                assert_eq!(code, ErrorCode::NOT_FOUND);
                assert!(message.len() <= u16::MAX as usize);
                assert_eq!(message.len() % 2, 0);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn context_info_reply_preserves_list_lengths() {
        let info = ContextInfo {
            vertex: 4,
            fragment: 5,
            fragment_textures: vec![7, 8],
            vertex_textures: vec![],
            cbufs: vec![9],
            zsbuf: 0,
            blocker: 1,
            blocked: 1,
        };
        let bytes = encode_reply(2, &Reply::ContextInfo(info.clone()), &Limits::default())
            .unwrap();
        let reply = decode_reply(&decode_frame(&bytes).unwrap()).unwrap();
        assert_eq!(reply, Reply::ContextInfo(info));
    }

    #[test]
    fn huge_id_count_does_not_preallocate() {
        let mut payload = Vec::new();
        push_u32(&mut payload, u32::MAX);
        let frame = Frame {
            opcode: -768,
            serial: 1,
            payload,
        };
        assert_eq!(decode_reply(&frame), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn draw_blocked_event_uses_serial_zero() {
        let bytes = encode_event(&Event::DrawBlocked {
            context: 12,
            blocked: crate::BLOCK_BEFORE | crate::BLOCK_RULE,
        });
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.opcode, 775);
        assert_eq!(frame.serial, 0);
        assert_eq!(
            decode_event(&frame).unwrap(),
            Event::DrawBlocked {
                context: 12,
                blocked: 5
            }
        );
    }
}
