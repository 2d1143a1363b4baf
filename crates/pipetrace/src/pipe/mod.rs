//! Backend capability surface.
//!
//! The proxy consumes these traits from the real backend and implements the very same traits
//! itself, so a caller holding an `Arc<dyn Screen>` or a `Box<dyn Context>` cannot tell which one
//! it has. Every object the backend hands out is named by an opaque [`Handle`]; "null" is
//! `Option<Handle>::None`.

mod format;
mod state;

pub use format::Format;
pub use state::*;

use serde::Serialize;

/// Opaque identity of a backend (or proxy) object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl Handle {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Converts a wire identity, where 0 means "none".
    pub fn from_wire(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

/// Convert an optional handle to its wire identity, where 0 means "none".
pub fn wire_id(handle: Option<Handle>) -> u64 {
    handle.map_or(0, Handle::get)
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Fences are never wrapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fence(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("unknown object {0}")]
    UnknownObject(Handle),

    #[error("transfer {0} was not mapped for {1}")]
    NotMapped(Handle, &'static str),

    #[error("access out of bounds: offset {offset} + {len} > {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("{0}")]
    Other(String),
}

/// The device factory.
pub trait Screen: Send + Sync {
    fn name(&self) -> String;
    fn vendor(&self) -> String;
    fn param(&self, cap: ScreenCap) -> i32;
    fn paramf(&self, cap: ScreenCapF) -> f32;
    fn is_format_supported(
        &self,
        format: Format,
        target: TextureTarget,
        sample_count: u32,
        bind: BindFlags,
    ) -> bool;

    fn create_context(&self) -> Option<Box<dyn Context>>;

    fn resource_create(&self, templ: &ResourceTemplate) -> Option<Handle>;
    fn user_buffer_create(&self, data: &[u8], bind: BindFlags) -> Option<Handle>;
    fn resource_destroy(&self, resource: Handle);

    fn flush_frontbuffer(&self, resource: Handle, level: u32, layer: u32);

    fn fence_finish(&self, fence: Fence, timeout_ns: u64) -> bool;
    fn fence_destroy(&self, fence: Fence);
}

/// Creation, binding and deletion of pipeline state.
pub trait StateBinder {
    fn create_blend_state(&mut self, state: &BlendState) -> Option<Handle>;
    fn bind_blend_state(&mut self, state: Option<Handle>);
    fn delete_blend_state(&mut self, state: Handle);

    fn create_sampler_state(&mut self, state: &SamplerState) -> Option<Handle>;
    fn bind_sampler_states(&mut self, stage: ShaderStage, states: &[Option<Handle>]);
    fn delete_sampler_state(&mut self, state: Handle);

    fn create_rasterizer_state(&mut self, state: &RasterizerState) -> Option<Handle>;
    fn bind_rasterizer_state(&mut self, state: Option<Handle>);
    fn delete_rasterizer_state(&mut self, state: Handle);

    fn create_depth_stencil_alpha_state(
        &mut self,
        state: &DepthStencilAlphaState,
    ) -> Option<Handle>;
    fn bind_depth_stencil_alpha_state(&mut self, state: Option<Handle>);
    fn delete_depth_stencil_alpha_state(&mut self, state: Handle);

    fn create_vertex_elements_state(&mut self, elements: &[VertexElement]) -> Option<Handle>;
    fn bind_vertex_elements_state(&mut self, state: Option<Handle>);
    fn delete_vertex_elements_state(&mut self, state: Handle);

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> Option<Handle>;
    fn bind_shader(&mut self, stage: ShaderStage, shader: Option<Handle>);
    fn delete_shader(&mut self, stage: ShaderStage, shader: Handle);

    fn set_blend_color(&mut self, color: [f32; 4]);
    fn set_stencil_ref(&mut self, stencil_ref: &StencilRef);
    fn set_clip_state(&mut self, clip: &ClipState);
    fn set_sample_mask(&mut self, mask: u32);
    fn set_constant_buffer(&mut self, stage: ShaderStage, index: u32, buffer: Option<Handle>);
    fn set_framebuffer_state(&mut self, fb: &FramebufferState);
    fn set_scissor_state(&mut self, scissor: &ScissorState);
    fn set_viewport_state(&mut self, viewport: &ViewportState);
    fn set_sampler_textures(&mut self, stage: ShaderStage, textures: &[Option<Handle>]);
    fn set_vertex_buffers(&mut self, buffers: &[VertexBuffer]);
    fn set_index_buffer(&mut self, buffer: Option<&IndexBuffer>);

    fn set_polygon_stipple(&mut self, stipple: &PolyStipple);

    fn create_sampler_view(
        &mut self,
        resource: Handle,
        templ: &SamplerViewTemplate,
    ) -> Option<Handle>;
    fn sampler_view_destroy(&mut self, view: Handle);
    fn set_sampler_views(&mut self, stage: ShaderStage, views: &[Option<Handle>]);

    fn create_surface(&mut self, resource: Handle, templ: &SurfaceTemplate) -> Option<Handle>;
    fn surface_destroy(&mut self, surface: Handle);
}

/// Draw-class and blit operations.
pub trait Drawable {
    fn draw_arrays(&mut self, mode: PrimitiveType, start: u32, count: u32);
    #[allow(clippy::too_many_arguments)]
    fn draw_elements(
        &mut self,
        index_buffer: Handle,
        index_size: u32,
        index_bias: i32,
        mode: PrimitiveType,
        start: u32,
        count: u32,
    );
    fn draw_vbo(&mut self, info: &DrawInfo);

    fn clear(&mut self, flags: ClearFlags, color: [f32; 4], depth: f64, stencil: u32);
    fn clear_render_target(&mut self, dst: Handle, color: [f32; 4], rect: Rect);
    fn clear_depth_stencil(
        &mut self,
        dst: Handle,
        flags: ClearFlags,
        depth: f64,
        stencil: u32,
        rect: Rect,
    );

    #[allow(clippy::too_many_arguments)]
    fn resource_copy_region(
        &mut self,
        dst: Handle,
        dst_level: u32,
        dst_origin: [u32; 3],
        src: Handle,
        src_level: u32,
        src_box: &PipeBox,
    );
}

/// CPU access to resource memory.
pub trait Mappable {
    fn transfer_map(
        &mut self,
        resource: Handle,
        level: u32,
        usage: TransferUsage,
        region: &PipeBox,
    ) -> Option<Transfer>;
    fn transfer_read(&mut self, transfer: Handle) -> Result<Vec<u8>, BackendError>;
    fn transfer_write(
        &mut self,
        transfer: Handle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError>;
    fn transfer_flush_region(&mut self, transfer: Handle, region: &PipeBox);
    fn transfer_unmap(&mut self, transfer: Handle);

    #[allow(clippy::too_many_arguments)]
    fn transfer_inline_write(
        &mut self,
        resource: Handle,
        level: u32,
        usage: TransferUsage,
        region: &PipeBox,
        data: &[u8],
        stride: u32,
        layer_stride: u32,
    );

    /// The application changed `size` bytes of a user buffer's memory at `offset`.
    fn redefine_user_buffer(&mut self, resource: Handle, offset: u32, size: u32);
}

/// A rendering context. Dropping it destroys it.
pub trait Context: StateBinder + Drawable + Mappable + Send {
    fn flush(&mut self) -> Option<Fence>;

    fn create_query(&mut self, query_type: QueryType) -> Option<Handle>;
    fn destroy_query(&mut self, query: Handle);
    fn begin_query(&mut self, query: Handle);
    fn end_query(&mut self, query: Handle);
    /// `Ok(None)` means the result is not available yet.
    fn get_query_result(&mut self, query: Handle, wait: bool)
        -> Result<Option<u64>, BackendError>;

    /// Predicate later rendering on `query`. `None` turns the condition off.
    fn render_condition(&mut self, query: Option<Handle>, mode: RenderConditionMode);

    fn texture_barrier(&mut self);
}
