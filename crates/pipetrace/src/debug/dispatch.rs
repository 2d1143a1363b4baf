use std::sync::Arc;

use pipetrace_protocol::{
    decode_request, encode_reply, DecodeError, ErrorCode, Frame, Limits, Opcode, Reply, Request,
    TextureData, TextureInfo,
};

use crate::context::block::{BlockFlags, DrawRule};
use crate::context::{ContextShared, ShaderReplaceError};
use crate::pipe::{Handle, PipeBox, ShaderSource, TransferUsage};
use crate::screen::ScreenShared;

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error("{class} {id:#x} not found")]
    NotFound { class: &'static str, id: u64 },

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Backend(String),
}

impl DispatchError {
    fn code(&self) -> ErrorCode {
        match self {
            DispatchError::NotFound { .. } => ErrorCode::NOT_FOUND,
            DispatchError::Invalid(_) => ErrorCode::PROTOCOL,
            DispatchError::Backend(_) => ErrorCode::BACKEND,
        }
    }
}

impl From<ShaderReplaceError> for DispatchError {
    fn from(err: ShaderReplaceError) -> Self {
        match err {
            ShaderReplaceError::NotFound(id) => DispatchError::NotFound {
                class: "shader",
                id: id.get(),
            },
            other => DispatchError::Backend(other.to_string()),
        }
    }
}

/// Decode, execute and encode the reply to one request frame.
pub(super) fn handle_frame(screen: &ScreenShared, frame: &Frame, limits: &Limits) -> Vec<u8> {
    let reply = match decode_request(frame) {
        Ok(request) => {
            tracing::trace!(serial = frame.serial, ?request, "debug request");
            dispatch(screen, request)
        }
        Err(DecodeError::UnknownOpcode(op)) => {
            Reply::error(ErrorCode::UNKNOWN_OPCODE, format!("unknown opcode {op}"))
        }
        Err(err) => Reply::error(ErrorCode::PROTOCOL, err.to_string()),
    };

    match encode_reply(frame.serial, &reply, limits) {
        Ok(bytes) => bytes,
        Err(err) => {
            let reply = Reply::error(ErrorCode::UNSUPPORTED, format!("reply not encodable: {err}"));
            encode_reply(frame.serial, &reply, limits).unwrap_or_default()
        }
    }
}

pub(super) fn dispatch(screen: &ScreenShared, request: Request) -> Reply {
    match execute(screen, request) {
        Ok(reply) => reply,
        Err(err) => Reply::error(err.code(), err.to_string()),
    }
}

fn execute(screen: &ScreenShared, request: Request) -> Result<Reply, DispatchError> {
    let reply = match request {
        Request::Ping => Reply::Pong,

        Request::TextureList => {
            Reply::TextureList(ids(screen.objects.lock().textures.list()))
        }
        Request::TextureInfo { texture } => Reply::TextureInfo(texture_info(screen, texture)?),
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
            let region = ReadRegion {
                face,
                level,
                zslice,
                x,
                y,
                width,
                height,
            };
            Reply::TextureRead(texture_read(screen, texture, region)?)
        }

        Request::ContextList => {
            Reply::ContextList(ids(screen.objects.lock().contexts.list()))
        }
        Request::ContextInfo { context } => {
            Reply::ContextInfo(lookup_context(screen, context)?.info())
        }
        Request::ContextDrawBlock { context, block } => {
            lookup_context(screen, context)?
                .gate
                .block(BlockFlags::from_bits_truncate(block));
            Reply::Ack(Opcode::ContextDrawBlock)
        }
        Request::ContextDrawStep { context, step } => {
            lookup_context(screen, context)?
                .gate
                .step(BlockFlags::from_bits_truncate(step));
            Reply::Ack(Opcode::ContextDrawStep)
        }
        Request::ContextDrawUnblock { context, unblock } => {
            lookup_context(screen, context)?
                .gate
                .unblock(BlockFlags::from_bits_truncate(unblock));
            Reply::Ack(Opcode::ContextDrawUnblock)
        }
        Request::ContextDrawRule { context, rule } => {
            lookup_context(screen, context)?.gate.set_rule(DrawRule {
                vertex: Handle::from_wire(rule.vertex),
                fragment: Handle::from_wire(rule.fragment),
                texture: Handle::from_wire(rule.texture),
                surface: Handle::from_wire(rule.surface),
                blocker: BlockFlags::from_bits_truncate(rule.block),
            });
            Reply::Ack(Opcode::ContextDrawRule)
        }
        Request::ContextFlush { context } => {
            if let Some(fence) = lookup_context(screen, context)?.flush() {
                screen.backend.fence_destroy(fence);
            }
            Reply::Ack(Opcode::ContextFlush)
        }

        Request::ShaderList { context } => {
            Reply::ShaderList(ids(lookup_context(screen, context)?.shader_list()))
        }
        Request::ShaderInfo { context, shader } => {
            let info = lookup_context(screen, context)?
                .shader_info(Handle(shader))
                .ok_or(DispatchError::NotFound {
                    class: "shader",
                    id: shader,
                })?;
            Reply::ShaderInfo(info)
        }
        Request::ShaderDisable {
            context,
            shader,
            disable,
        } => {
            if !lookup_context(screen, context)?.shader_disable(Handle(shader), disable) {
                return Err(DispatchError::NotFound {
                    class: "shader",
                    id: shader,
                });
            }
            Reply::Ack(Opcode::ShaderDisable)
        }
        Request::ShaderReplace {
            context,
            shader,
            source,
        } => {
            lookup_context(screen, context)?
                .shader_replace(Handle(shader), source.map(ShaderSource::new))?;
            Reply::Ack(Opcode::ShaderReplace)
        }
    };
    Ok(reply)
}

fn ids(handles: Vec<Handle>) -> Vec<u64> {
    handles.into_iter().map(Handle::get).collect()
}

/// The registry lock is released before the caller acts on the context.
fn lookup_context(screen: &ScreenShared, id: u64) -> Result<Arc<ContextShared>, DispatchError> {
    let found = Handle::from_wire(id).and_then(|h| screen.objects.lock().contexts.get(h).cloned());
    found.ok_or(DispatchError::NotFound {
        class: "context",
        id,
    })
}

fn texture_info(screen: &ScreenShared, id: u64) -> Result<TextureInfo, DispatchError> {
    let res = screen
        .texture(Handle(id))
        .ok_or(DispatchError::NotFound { class: "texture", id })?;
    let templ = res.templ;
    Ok(TextureInfo {
        target: templ.target as u32,
        format: templ.format.as_u32(),
        levels: (0..=templ.last_level)
            .map(|level| templ.level_extent(level))
            .collect(),
        block_width: templ.format.block_width(),
        block_height: templ.format.block_height(),
        block_size: templ.format.block_size(),
        last_level: templ.last_level,
        nr_samples: templ.nr_samples,
        bind: templ.bind.bits(),
        usage: templ.usage as u32,
    })
}

struct ReadRegion {
    face: u32,
    level: u32,
    zslice: u32,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Map the texture on the screen's private context and copy the region out.
///
/// A zero `width`/`height` means "to the edge of the level".
fn texture_read(
    screen: &ScreenShared,
    id: u64,
    region: ReadRegion,
) -> Result<TextureData, DispatchError> {
    let res = screen
        .texture(Handle(id))
        .ok_or(DispatchError::NotFound { class: "texture", id })?;
    let templ = res.templ;
    if region.level > templ.last_level {
        return Err(DispatchError::Invalid(format!(
            "level {} out of range (last level {})",
            region.level, templ.last_level
        )));
    }

    let [level_w, level_h, _] = templ.level_extent(region.level);
    if region.x >= level_w || region.y >= level_h {
        return Err(DispatchError::Invalid(format!(
            "origin {},{} outside {level_w}x{level_h} level",
            region.x, region.y
        )));
    }
    let width = match region.width {
        0 => level_w - region.x,
        w => w.min(level_w - region.x),
    };
    let height = match region.height {
        0 => level_h - region.y,
        h => h.min(level_h - region.y),
    };
    let pipe_box = PipeBox {
        x: region.x,
        y: region.y,
        z: region.face.saturating_add(region.zslice),
        width,
        height,
        depth: 1,
    };

    let mapped = screen.with_private_context(|ctx| {
        let transfer = ctx
            .transfer_map(res.backend, region.level, TransferUsage::READ, &pipe_box)
            .ok_or_else(|| DispatchError::Backend("texture map failed".to_owned()))?;
        let data = ctx.transfer_read(transfer.handle);
        ctx.transfer_unmap(transfer.handle);
        let data = data.map_err(|err| DispatchError::Backend(err.to_string()))?;
        Ok::<_, DispatchError>((transfer.stride, data))
    });
    let (stride, data) = mapped
        .ok_or_else(|| DispatchError::Backend("no private context available".to_owned()))??;

    Ok(TextureData {
        format: templ.format.as_u32(),
        block_width: templ.format.block_width(),
        block_height: templ.format.block_height(),
        block_size: templ.format.block_size(),
        stride,
        data,
    })
}
