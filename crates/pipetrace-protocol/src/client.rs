//! Blocking debug protocol client.
//!
//! Replies are matched to requests by serial. Unsolicited events that arrive while waiting for a
//! reply are queued and handed out by [`Client::next_event`].

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::{
    decode_event, decode_reply, encode_request, ContextInfo, DecodeError, DrawRule, ErrorCode,
    Event, Frame, FrameParser, Limits, Opcode, Reply, Request, ShaderInfo, TextureData,
    TextureInfo,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] crate::Error),

    #[error("malformed message from server: {0}")]
    Decode(#[from] DecodeError),

    #[error("server closed the connection")]
    Closed,

    #[error("server error ({code}): {message}")]
    Server { code: ErrorCode, message: String },

    #[error("unexpected reply to {request:?}: {reply:?}")]
    UnexpectedReply { request: Opcode, reply: Box<Reply> },
}

pub struct Client {
    stream: TcpStream,
    parser: FrameParser,
    limits: Limits,
    next_serial: u32,
    frames: VecDeque<Frame>,
    events: VecDeque<Event>,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, Limits::default()))
    }

    pub fn from_stream(stream: TcpStream, limits: Limits) -> Self {
        Self {
            stream,
            parser: FrameParser::with_limits(limits),
            limits,
            next_serial: 1,
            frames: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Send `request` and wait for its reply. `ERROR` replies are returned as [`Reply::Error`].
    pub fn request(&mut self, request: &Request) -> Result<Reply, ClientError> {
        let serial = self.next_serial;
        // Serial 0 is reserved for events.
        self.next_serial = self.next_serial.wrapping_add(1).max(1);

        let bytes = encode_request(serial, request, &self.limits)?;
        self.stream.write_all(&bytes)?;

        loop {
            let frame = self.read_frame()?;
            if frame.serial == 0 && frame.opcode > 0 {
                self.events.push_back(decode_event(&frame)?);
                continue;
            }
            if frame.serial != serial {
                tracing::debug!(
                    serial = frame.serial,
                    expected = serial,
                    "dropping reply for another request"
                );
                continue;
            }
            return Ok(decode_reply(&frame)?);
        }
    }

    fn call(&mut self, request: Request) -> Result<Reply, ClientError> {
        match self.request(&request)? {
            Reply::Error { code, message } => Err(ClientError::Server { code, message }),
            reply => Ok(reply),
        }
    }

    fn call_ack(&mut self, request: Request) -> Result<(), ClientError> {
        let op = request.opcode();
        match self.call(request)? {
            Reply::Ack(acked) if acked == op => Ok(()),
            reply => Err(unexpected(op, reply)),
        }
    }

    pub fn ping(&mut self) -> Result<(), ClientError> {
        match self.call(Request::Ping)? {
            Reply::Pong => Ok(()),
            reply => Err(unexpected(Opcode::Ping, reply)),
        }
    }

    pub fn texture_list(&mut self) -> Result<Vec<u64>, ClientError> {
        match self.call(Request::TextureList)? {
            Reply::TextureList(ids) => Ok(ids),
            reply => Err(unexpected(Opcode::TextureList, reply)),
        }
    }

    pub fn texture_info(&mut self, texture: u64) -> Result<TextureInfo, ClientError> {
        match self.call(Request::TextureInfo { texture })? {
            Reply::TextureInfo(info) => Ok(info),
            reply => Err(unexpected(Opcode::TextureInfo, reply)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn texture_read(
        &mut self,
        texture: u64,
        face: u32,
        level: u32,
        zslice: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<TextureData, ClientError> {
        let request = Request::TextureRead {
            texture,
            face,
            level,
            zslice,
            x,
            y,
            width,
            height,
        };
        match self.call(request)? {
            Reply::TextureRead(data) => Ok(data),
            reply => Err(unexpected(Opcode::TextureRead, reply)),
        }
    }

    pub fn context_list(&mut self) -> Result<Vec<u64>, ClientError> {
        match self.call(Request::ContextList)? {
            Reply::ContextList(ids) => Ok(ids),
            reply => Err(unexpected(Opcode::ContextList, reply)),
        }
    }

    pub fn context_info(&mut self, context: u64) -> Result<ContextInfo, ClientError> {
        match self.call(Request::ContextInfo { context })? {
            Reply::ContextInfo(info) => Ok(info),
            reply => Err(unexpected(Opcode::ContextInfo, reply)),
        }
    }

    pub fn draw_block(&mut self, context: u64, block: u32) -> Result<(), ClientError> {
        self.call_ack(Request::ContextDrawBlock { context, block })
    }

    pub fn draw_step(&mut self, context: u64, step: u32) -> Result<(), ClientError> {
        self.call_ack(Request::ContextDrawStep { context, step })
    }

    pub fn draw_unblock(&mut self, context: u64, unblock: u32) -> Result<(), ClientError> {
        self.call_ack(Request::ContextDrawUnblock { context, unblock })
    }

    pub fn draw_rule(&mut self, context: u64, rule: DrawRule) -> Result<(), ClientError> {
        self.call_ack(Request::ContextDrawRule { context, rule })
    }

    pub fn flush(&mut self, context: u64) -> Result<(), ClientError> {
        self.call_ack(Request::ContextFlush { context })
    }

    pub fn shader_list(&mut self, context: u64) -> Result<Vec<u64>, ClientError> {
        match self.call(Request::ShaderList { context })? {
            Reply::ShaderList(ids) => Ok(ids),
            reply => Err(unexpected(Opcode::ShaderList, reply)),
        }
    }

    pub fn shader_info(&mut self, context: u64, shader: u64) -> Result<ShaderInfo, ClientError> {
        match self.call(Request::ShaderInfo { context, shader })? {
            Reply::ShaderInfo(info) => Ok(info),
            reply => Err(unexpected(Opcode::ShaderInfo, reply)),
        }
    }

    pub fn shader_disable(
        &mut self,
        context: u64,
        shader: u64,
        disable: bool,
    ) -> Result<(), ClientError> {
        self.call_ack(Request::ShaderDisable {
            context,
            shader,
            disable,
        })
    }

    pub fn shader_replace(
        &mut self,
        context: u64,
        shader: u64,
        source: Option<String>,
    ) -> Result<(), ClientError> {
        self.call_ack(Request::ShaderReplace {
            context,
            shader,
            source,
        })
    }

    /// Wait up to `timeout` (forever when `None`) for an unsolicited event.
    pub fn next_event(&mut self, timeout: Option<Duration>) -> Result<Option<Event>, ClientError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }

        self.stream.set_read_timeout(timeout)?;
        let res = loop {
            match self.read_frame() {
                Ok(frame) if frame.serial == 0 && frame.opcode > 0 => {
                    break decode_event(&frame).map(Some).map_err(ClientError::from);
                }
                Ok(frame) => {
                    tracing::debug!(serial = frame.serial, "dropping unmatched reply");
                }
                Err(ClientError::Io(err))
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break Ok(None);
                }
                Err(err) => break Err(err),
            }
        };
        self.stream.set_read_timeout(None)?;
        res
    }

    fn read_frame(&mut self) -> Result<Frame, ClientError> {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.frames.extend(self.parser.push(&buf[..n])?);
        }
    }
}

fn unexpected(request: Opcode, reply: Reply) -> ClientError {
    ClientError::UnexpectedReply {
        request,
        reply: Box::new(reply),
    }
}
