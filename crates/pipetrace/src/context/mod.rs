//! Proxy rendering context.
//!
//! Every forwarded operation unwraps its proxy arguments, records the call with the backend
//! identities the backend actually sees, forwards, and re-wraps whatever new object comes back.
//! Draws additionally pass through the context's [`DrawGate`] before and after reaching the
//! backend.

pub mod block;
pub mod state;

use std::sync::Arc;

use parking_lot::Mutex;

use self::block::{BlockFlags, DrawGate};
use self::state::BoundState;
use crate::debug::DebugEvent;
use crate::pipe::{
    wire_id, BackendError, BlendState, ClearFlags, ClipState, Context, DepthStencilAlphaState,
    DrawInfo, Drawable, Fence, FramebufferState, Handle, IndexBuffer, Mappable, PipeBox,
    PolyStipple, PrimitiveType, QueryType, RasterizerState, Rect, RenderConditionMode,
    SamplerState, SamplerViewTemplate, ScissorState, ShaderSource, ShaderStage, StateBinder,
    StencilRef, SurfaceTemplate, Transfer, TransferUsage, VertexBuffer, VertexElement,
    ViewportState,
};
use crate::registry::{Registry, ResourceClass};
use crate::resource::{ProxySamplerView, ProxyShader, ProxySurface, ProxyTransfer, Replacement};
use crate::screen::ScreenShared;
use crate::trace::{CallRecord, TraceValue};

/// Per-context objects and bindings, guarded by the context mutex.
pub(crate) struct ContextState {
    pub(crate) bound: BoundState,
    pub(crate) shaders: Registry<ProxyShader>,
    pub(crate) transfers: Registry<ProxyTransfer>,
}

/// The part of a proxy context the debug server can reach.
///
/// Lock order is `state` before `backend`. The draw gate is never taken while either is held by
/// a draw thread.
pub(crate) struct ContextShared {
    pub(crate) id: Handle,
    backend: Mutex<Option<Box<dyn Context>>>,
    pub(crate) state: Mutex<ContextState>,
    pub(crate) gate: DrawGate,
}

/// Why a shader replacement was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ShaderReplaceError {
    #[error("shader {0} not found")]
    NotFound(Handle),
    #[error("backend rejected the replacement program")]
    Rejected,
    #[error("context is being destroyed")]
    Destroyed,
}

impl ContextShared {
    pub(crate) fn new(id: Handle, backend: Box<dyn Context>, blocker: BlockFlags) -> Self {
        Self {
            id,
            backend: Mutex::new(Some(backend)),
            state: Mutex::new(ContextState {
                bound: BoundState::default(),
                shaders: Registry::new(ResourceClass::Shader),
                transfers: Registry::new(ResourceClass::Transfer),
            }),
            gate: DrawGate::new(blocker),
        }
    }

    /// Run `f` on the backend context, unless it has already been destroyed.
    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn Context) -> R) -> Option<R> {
        let mut backend = self.backend.lock();
        match backend.as_mut() {
            Some(ctx) => Some(f(&mut **ctx)),
            None => None,
        }
    }

    pub(crate) fn info(&self) -> pipetrace_protocol::ContextInfo {
        let ids = |handles: &[Option<Handle>]| -> Vec<u64> {
            handles.iter().map(|h| wire_id(*h)).collect()
        };
        let mut info = {
            let state = self.state.lock();
            let bound = &state.bound;
            pipetrace_protocol::ContextInfo {
                vertex: wire_id(bound.shader(ShaderStage::Vertex)),
                fragment: wire_id(bound.shader(ShaderStage::Fragment)),
                fragment_textures: ids(bound.textures(ShaderStage::Fragment)),
                vertex_textures: ids(bound.textures(ShaderStage::Vertex)),
                cbufs: ids(bound.cbufs.as_slice()),
                zsbuf: wire_id(bound.zsbuf),
                blocker: 0,
                blocked: 0,
            }
        };
        let block = self.gate.snapshot();
        info.blocker = block.blocker.bits();
        info.blocked = block.blocked.bits();
        info
    }

    pub(crate) fn shader_list(&self) -> Vec<Handle> {
        self.state.lock().shaders.list()
    }

    pub(crate) fn shader_info(&self, shader: Handle) -> Option<pipetrace_protocol::ShaderInfo> {
        let state = self.state.lock();
        let shader = state.shaders.get(shader)?;
        Some(pipetrace_protocol::ShaderInfo {
            stage: shader.stage.as_u32(),
            disabled: shader.disabled,
            original: shader.source.as_str().to_owned(),
            replaced: shader
                .replaced
                .as_ref()
                .map(|r| r.source.as_str().to_owned()),
        })
    }

    /// Returns false if the shader is unknown.
    pub(crate) fn shader_disable(&self, shader: Handle, disable: bool) -> bool {
        let mut state = self.state.lock();
        match state.shaders.get_mut(shader) {
            Some(shader) => {
                shader.disabled = disable;
                true
            }
            None => false,
        }
    }

    /// Install `source` in place of the shader's program, or restore the original when `source`
    /// is absent or empty.
    ///
    /// The new program is compiled before anything is torn down, so a rejected replacement leaves
    /// the previous one active. If the shader is currently bound it is rebound immediately.
    pub(crate) fn shader_replace(
        &self,
        shader: Handle,
        source: Option<ShaderSource>,
    ) -> Result<(), ShaderReplaceError> {
        let mut state = self.state.lock();
        let ContextState { bound, shaders, .. } = &mut *state;
        let proxy = shaders
            .get_mut(shader)
            .ok_or(ShaderReplaceError::NotFound(shader))?;
        let stages: Vec<ShaderStage> = bound.stages_bound_to(shader).collect();

        let mut backend = self.backend.lock();
        let ctx = backend.as_mut().ok_or(ShaderReplaceError::Destroyed)?;

        let replacement = match source.filter(|s| !s.is_empty()) {
            Some(source) => {
                let program = ctx
                    .create_shader(proxy.stage, &source)
                    .ok_or(ShaderReplaceError::Rejected)?;
                Some(Replacement {
                    backend: program,
                    source,
                })
            }
            None => None,
        };

        let previous = std::mem::replace(&mut proxy.replaced, replacement);
        let effective = proxy.effective();
        for stage in stages {
            ctx.bind_shader(stage, Some(effective));
        }
        if let Some(previous) = previous {
            ctx.delete_shader(proxy.stage, previous.backend);
        }

        tracing::debug!(
            context = %self.id,
            %shader,
            replaced = proxy.replaced.is_some(),
            "shader program swapped"
        );
        Ok(())
    }

    pub(crate) fn flush(&self) -> Option<Fence> {
        self.with_backend(|ctx| ctx.flush()).flatten()
    }
}

/// Programs a draw will run with, read once the draw is released past the `BEFORE` gate.
struct DrawPrograms {
    programs: [Option<Handle>; 2],
    skip: bool,
}

impl DrawPrograms {
    fn of(state: &ContextState) -> Self {
        let shaders = ShaderStage::ALL.map(|stage| {
            state
                .bound
                .shader(stage)
                .and_then(|id| state.shaders.get(id))
        });
        Self {
            programs: shaders.map(|s| s.map(ProxyShader::effective)),
            skip: shaders.iter().flatten().any(|s| s.disabled),
        }
    }

    fn get(&self, stage: ShaderStage) -> Option<Handle> {
        self.programs[stage.index()]
    }
}

/// A traced context handed out by [`crate::ProxyScreen`].
pub struct ProxyContext {
    screen: Arc<ScreenShared>,
    shared: Arc<ContextShared>,
}

impl ProxyContext {
    pub(crate) fn new(screen: Arc<ScreenShared>, shared: Arc<ContextShared>) -> Self {
        Self { screen, shared }
    }

    /// Proxy identity of this context, as listed by the debug server.
    pub fn id(&self) -> Handle {
        self.shared.id
    }

    fn begin(&self, method: &'static str) -> CallRecord<'_> {
        let mut rec = self.screen.trace.begin_call("pipe_context", method);
        rec.arg("pipe", self.shared.id);
        rec
    }

    fn forward<R>(&self, f: impl FnOnce(&mut dyn Context) -> R) -> Option<R> {
        self.shared.with_backend(f)
    }

    fn wait_gate(&self, phase: BlockFlags, bound: &BoundState) {
        let context = self.shared.id;
        let screen = &self.screen;
        let held = self.shared.gate.check(phase, bound, |blocked| {
            tracing::debug!(%context, ?blocked, "draw blocked");
            screen.notify(DebugEvent::DrawBlocked { context, blocked });
        });
        if !held.is_empty() {
            tracing::debug!(%context, ?held, "draw released");
        }
    }

    /// Common path for every draw-class call.
    fn draw(
        &self,
        method: &'static str,
        args: impl FnOnce(&mut CallRecord<'_>),
        forward: impl FnOnce(&mut dyn Context),
    ) {
        // Copied out so no lock is held while blocked.
        let bound = self.shared.state.lock().bound.clone();

        let mut rec = self.begin(method);
        args(&mut rec);
        self.wait_gate(BlockFlags::BEFORE, &bound);

        // A paused draw honours disables and replacements made while it waited. The state lock is
        // held across the forward so the recorded programs are the ones the backend runs.
        let state = self.shared.state.lock();
        let programs = DrawPrograms::of(&state);
        rec.arg("vs", programs.get(ShaderStage::Vertex));
        rec.arg("fs", programs.get(ShaderStage::Fragment));
        if programs.skip {
            rec.ret(TraceValue::enumerant("skipped"));
        } else {
            self.forward(forward);
        }
        drop(state);

        self.wait_gate(BlockFlags::AFTER, &bound);
        rec.end();
    }

    fn transfer_backend(&self, transfer: Handle) -> Option<Handle> {
        let backend = self
            .shared
            .state
            .lock()
            .transfers
            .get(transfer)
            .map(|t| t.backend);
        debug_assert!(backend.is_some(), "unknown transfer {transfer}");
        backend
    }
}

fn stage_value(stage: ShaderStage) -> TraceValue {
    TraceValue::enumerant(match stage {
        ShaderStage::Vertex => "PIPE_SHADER_VERTEX",
        ShaderStage::Fragment => "PIPE_SHADER_FRAGMENT",
    })
}

fn ptrs(handles: &[Option<Handle>]) -> TraceValue {
    TraceValue::array(handles.iter().copied())
}

impl StateBinder for ProxyContext {
    fn create_blend_state(&mut self, state: &BlendState) -> Option<Handle> {
        let mut rec = self.begin("create_blend_state");
        rec.arg("state", TraceValue::from_serialize("pipe_blend_state", state));
        let ret = self.forward(|ctx| ctx.create_blend_state(state)).flatten();
        rec.ret(ret);
        ret
    }

    fn bind_blend_state(&mut self, state: Option<Handle>) {
        self.begin("bind_blend_state").arg("state", state);
        self.forward(|ctx| ctx.bind_blend_state(state));
    }

    fn delete_blend_state(&mut self, state: Handle) {
        self.begin("delete_blend_state").arg("state", state);
        self.forward(|ctx| ctx.delete_blend_state(state));
    }

    fn create_sampler_state(&mut self, state: &SamplerState) -> Option<Handle> {
        let mut rec = self.begin("create_sampler_state");
        rec.arg("state", TraceValue::from_serialize("pipe_sampler_state", state));
        let ret = self.forward(|ctx| ctx.create_sampler_state(state)).flatten();
        rec.ret(ret);
        ret
    }

    fn bind_sampler_states(&mut self, stage: ShaderStage, states: &[Option<Handle>]) {
        self.begin("bind_sampler_states")
            .arg("shader", stage_value(stage))
            .arg("num_states", states.len())
            .arg("states", ptrs(states));
        self.forward(|ctx| ctx.bind_sampler_states(stage, states));
    }

    fn delete_sampler_state(&mut self, state: Handle) {
        self.begin("delete_sampler_state").arg("state", state);
        self.forward(|ctx| ctx.delete_sampler_state(state));
    }

    fn create_rasterizer_state(&mut self, state: &RasterizerState) -> Option<Handle> {
        let mut rec = self.begin("create_rasterizer_state");
        rec.arg(
            "state",
            TraceValue::from_serialize("pipe_rasterizer_state", state),
        );
        let ret = self.forward(|ctx| ctx.create_rasterizer_state(state)).flatten();
        rec.ret(ret);
        ret
    }

    fn bind_rasterizer_state(&mut self, state: Option<Handle>) {
        self.begin("bind_rasterizer_state").arg("state", state);
        self.forward(|ctx| ctx.bind_rasterizer_state(state));
    }

    fn delete_rasterizer_state(&mut self, state: Handle) {
        self.begin("delete_rasterizer_state").arg("state", state);
        self.forward(|ctx| ctx.delete_rasterizer_state(state));
    }

    fn create_depth_stencil_alpha_state(
        &mut self,
        state: &DepthStencilAlphaState,
    ) -> Option<Handle> {
        let mut rec = self.begin("create_depth_stencil_alpha_state");
        rec.arg(
            "state",
            TraceValue::from_serialize("pipe_depth_stencil_alpha_state", state),
        );
        let ret = self
            .forward(|ctx| ctx.create_depth_stencil_alpha_state(state))
            .flatten();
        rec.ret(ret);
        ret
    }

    fn bind_depth_stencil_alpha_state(&mut self, state: Option<Handle>) {
        self.begin("bind_depth_stencil_alpha_state")
            .arg("state", state);
        self.forward(|ctx| ctx.bind_depth_stencil_alpha_state(state));
    }

    fn delete_depth_stencil_alpha_state(&mut self, state: Handle) {
        self.begin("delete_depth_stencil_alpha_state")
            .arg("state", state);
        self.forward(|ctx| ctx.delete_depth_stencil_alpha_state(state));
    }

    fn create_vertex_elements_state(&mut self, elements: &[VertexElement]) -> Option<Handle> {
        let mut rec = self.begin("create_vertex_elements_state");
        rec.arg("num_elements", elements.len());
        rec.arg(
            "elements",
            TraceValue::from_serialize("pipe_vertex_element", elements),
        );
        let ret = self
            .forward(|ctx| ctx.create_vertex_elements_state(elements))
            .flatten();
        rec.ret(ret);
        ret
    }

    fn bind_vertex_elements_state(&mut self, state: Option<Handle>) {
        self.begin("bind_vertex_elements_state").arg("state", state);
        self.forward(|ctx| ctx.bind_vertex_elements_state(state));
    }

    fn delete_vertex_elements_state(&mut self, state: Handle) {
        self.begin("delete_vertex_elements_state")
            .arg("state", state);
        self.forward(|ctx| ctx.delete_vertex_elements_state(state));
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> Option<Handle> {
        let mut rec = self.begin("create_shader");
        rec.arg("shader", stage_value(stage));
        rec.arg("tokens", source.as_str());
        let program = self.forward(|ctx| ctx.create_shader(stage, source)).flatten();
        rec.ret(program);
        rec.end();

        let program = program?;
        let id = self.screen.alloc_id();
        self.shared
            .state
            .lock()
            .shaders
            .register(id, ProxyShader::new(stage, program, source.clone()));
        Some(id)
    }

    fn bind_shader(&mut self, stage: ShaderStage, shader: Option<Handle>) {
        let mut state = self.shared.state.lock();
        let program = shader.and_then(|id| {
            let proxy = state.shaders.get(id);
            debug_assert!(proxy.is_some(), "bind of unknown shader {id}");
            debug_assert!(proxy.map_or(true, |s| s.stage == stage));
            proxy.map(ProxyShader::effective)
        });
        state.bound.set_shader(stage, shader);

        self.begin("bind_shader")
            .arg("shader", stage_value(stage))
            .arg("state", program);
        // Still under the state lock so a concurrent replace cannot rebind in between.
        self.forward(|ctx| ctx.bind_shader(stage, program));
    }

    fn delete_shader(&mut self, stage: ShaderStage, shader: Handle) {
        let mut state = self.shared.state.lock();
        let Some(proxy) = state.shaders.unregister(shader) else {
            debug_assert!(false, "delete of unknown shader {shader}");
            return;
        };

        self.begin("delete_shader")
            .arg("shader", stage_value(stage))
            .arg("state", proxy.original);
        self.forward(|ctx| {
            ctx.delete_shader(stage, proxy.original);
            if let Some(replaced) = &proxy.replaced {
                ctx.delete_shader(stage, replaced.backend);
            }
        });
    }

    fn set_blend_color(&mut self, color: [f32; 4]) {
        self.begin("set_blend_color").arg("color", color);
        self.forward(|ctx| ctx.set_blend_color(color));
    }

    fn set_stencil_ref(&mut self, stencil_ref: &StencilRef) {
        self.begin("set_stencil_ref").arg(
            "state",
            TraceValue::from_serialize("pipe_stencil_ref", stencil_ref),
        );
        self.forward(|ctx| ctx.set_stencil_ref(stencil_ref));
    }

    fn set_clip_state(&mut self, clip: &ClipState) {
        self.begin("set_clip_state")
            .arg("state", TraceValue::from_serialize("pipe_clip_state", clip));
        self.forward(|ctx| ctx.set_clip_state(clip));
    }

    fn set_sample_mask(&mut self, mask: u32) {
        self.begin("set_sample_mask").arg("sample_mask", mask);
        self.forward(|ctx| ctx.set_sample_mask(mask));
    }

    fn set_constant_buffer(&mut self, stage: ShaderStage, index: u32, buffer: Option<Handle>) {
        let backend = self.screen.unwrap_resource(buffer);
        self.begin("set_constant_buffer")
            .arg("shader", stage_value(stage))
            .arg("index", index)
            .arg("buffer", backend);
        self.forward(|ctx| ctx.set_constant_buffer(stage, index, backend));
    }

    fn set_framebuffer_state(&mut self, fb: &FramebufferState) {
        let unwrapped = FramebufferState {
            width: fb.width,
            height: fb.height,
            cbufs: fb
                .cbufs
                .iter()
                .map(|s| self.screen.unwrap_surface(*s))
                .collect(),
            zsbuf: self.screen.unwrap_surface(fb.zsbuf),
        };

        let mut state = self.shared.state.lock();
        state.bound.cbufs = fb.cbufs.clone();
        state.bound.zsbuf = fb.zsbuf;
        drop(state);

        self.begin("set_framebuffer_state").arg(
            "state",
            TraceValue::from_serialize("pipe_framebuffer_state", &unwrapped),
        );
        self.forward(|ctx| ctx.set_framebuffer_state(&unwrapped));
    }

    fn set_scissor_state(&mut self, scissor: &ScissorState) {
        self.begin("set_scissor_state").arg(
            "state",
            TraceValue::from_serialize("pipe_scissor_state", scissor),
        );
        self.forward(|ctx| ctx.set_scissor_state(scissor));
    }

    fn set_viewport_state(&mut self, viewport: &ViewportState) {
        self.begin("set_viewport_state").arg(
            "state",
            TraceValue::from_serialize("pipe_viewport_state", viewport),
        );
        self.forward(|ctx| ctx.set_viewport_state(viewport));
    }

    fn set_sampler_textures(&mut self, stage: ShaderStage, textures: &[Option<Handle>]) {
        let unwrapped: Vec<Option<Handle>> = textures
            .iter()
            .map(|t| self.screen.unwrap_resource(*t))
            .collect();
        self.shared
            .state
            .lock()
            .bound
            .set_textures(stage, textures.to_vec());

        self.begin("set_sampler_textures")
            .arg("shader", stage_value(stage))
            .arg("num_textures", textures.len())
            .arg("textures", ptrs(&unwrapped));
        self.forward(|ctx| ctx.set_sampler_textures(stage, &unwrapped));
    }

    fn set_vertex_buffers(&mut self, buffers: &[VertexBuffer]) {
        let unwrapped: Vec<VertexBuffer> = buffers
            .iter()
            .map(|vb| VertexBuffer {
                buffer: self.screen.unwrap_resource(vb.buffer),
                ..*vb
            })
            .collect();
        self.begin("set_vertex_buffers")
            .arg("num_buffers", buffers.len())
            .arg(
                "buffers",
                TraceValue::from_serialize("pipe_vertex_buffer", &unwrapped),
            );
        self.forward(|ctx| ctx.set_vertex_buffers(&unwrapped));
    }

    fn set_index_buffer(&mut self, buffer: Option<&IndexBuffer>) {
        let unwrapped = buffer.map(|ib| IndexBuffer {
            buffer: self.screen.unwrap_resource(ib.buffer),
            ..*ib
        });
        self.begin("set_index_buffer").arg(
            "ib",
            TraceValue::from_serialize("pipe_index_buffer", &unwrapped),
        );
        self.forward(|ctx| ctx.set_index_buffer(unwrapped.as_ref()));
    }

    fn set_polygon_stipple(&mut self, stipple: &PolyStipple) {
        self.begin("set_polygon_stipple").arg(
            "state",
            TraceValue::from_serialize("pipe_poly_stipple", stipple),
        );
        self.forward(|ctx| ctx.set_polygon_stipple(stipple));
    }

    fn create_sampler_view(
        &mut self,
        resource: Handle,
        templ: &SamplerViewTemplate,
    ) -> Option<Handle> {
        let backend_resource = self.screen.unwrap_resource(Some(resource));
        let mut rec = self.begin("create_sampler_view");
        rec.arg("resource", backend_resource);
        rec.arg(
            "templ",
            TraceValue::from_serialize("pipe_sampler_view", templ),
        );
        let view = backend_resource.and_then(|res| {
            self.forward(|ctx| ctx.create_sampler_view(res, templ))
                .flatten()
        });
        rec.ret(view);
        rec.end();

        let backend = view?;
        let id = self.screen.alloc_id();
        self.screen.objects.lock().sampler_views.register(
            id,
            ProxySamplerView {
                backend,
                resource,
                context: self.shared.id,
            },
        );
        Some(id)
    }

    fn sampler_view_destroy(&mut self, view: Handle) {
        let Some(proxy) = self.screen.sampler_view(Some(view)) else {
            return;
        };
        self.begin("sampler_view_destroy").arg("view", proxy.backend);
        self.screen.objects.lock().sampler_views.unregister(view);
        self.forward(|ctx| ctx.sampler_view_destroy(proxy.backend));
    }

    fn set_sampler_views(&mut self, stage: ShaderStage, views: &[Option<Handle>]) {
        let proxies: Vec<Option<ProxySamplerView>> = views
            .iter()
            .map(|v| self.screen.sampler_view(*v))
            .collect();
        let unwrapped: Vec<Option<Handle>> =
            proxies.iter().map(|v| v.map(|v| v.backend)).collect();
        // Bindings report the viewed textures, same as set_sampler_textures.
        let textures = proxies.iter().map(|v| v.map(|v| v.resource)).collect();
        self.shared.state.lock().bound.set_textures(stage, textures);

        self.begin("set_sampler_views")
            .arg("shader", stage_value(stage))
            .arg("num", views.len())
            .arg("views", ptrs(&unwrapped));
        self.forward(|ctx| ctx.set_sampler_views(stage, &unwrapped));
    }

    fn create_surface(&mut self, resource: Handle, templ: &SurfaceTemplate) -> Option<Handle> {
        let backend_resource = self.screen.unwrap_resource(Some(resource));
        let mut rec = self.begin("create_surface");
        rec.arg("resource", backend_resource);
        rec.arg(
            "templat",
            TraceValue::from_serialize("pipe_surface", templ),
        );
        let surface = backend_resource
            .and_then(|res| self.forward(|ctx| ctx.create_surface(res, templ)).flatten());
        rec.ret(surface);
        rec.end();

        let backend = surface?;
        let id = self.screen.alloc_id();
        self.screen.objects.lock().surfaces.register(
            id,
            ProxySurface {
                backend,
                context: self.shared.id,
            },
        );
        Some(id)
    }

    fn surface_destroy(&mut self, surface: Handle) {
        let Some(backend) = self.screen.unwrap_surface(Some(surface)) else {
            return;
        };
        self.begin("surface_destroy").arg("surface", backend);
        self.screen.objects.lock().surfaces.unregister(surface);
        self.forward(|ctx| ctx.surface_destroy(backend));
    }
}

impl Drawable for ProxyContext {
    fn draw_arrays(&mut self, mode: PrimitiveType, start: u32, count: u32) {
        self.draw(
            "draw_arrays",
            |rec| {
                rec.arg("mode", TraceValue::from_enum(&mode))
                    .arg("start", start)
                    .arg("count", count);
            },
            |ctx| ctx.draw_arrays(mode, start, count),
        );
    }

    fn draw_elements(
        &mut self,
        index_buffer: Handle,
        index_size: u32,
        index_bias: i32,
        mode: PrimitiveType,
        start: u32,
        count: u32,
    ) {
        let Some(backend) = self.screen.unwrap_resource(Some(index_buffer)) else {
            tracing::warn!(%index_buffer, "draw_elements with unknown index buffer dropped");
            return;
        };
        self.draw(
            "draw_elements",
            |rec| {
                rec.arg("indexBuffer", backend)
                    .arg("indexSize", index_size)
                    .arg("indexBias", index_bias)
                    .arg("mode", TraceValue::from_enum(&mode))
                    .arg("start", start)
                    .arg("count", count);
            },
            |ctx| ctx.draw_elements(backend, index_size, index_bias, mode, start, count),
        );
    }

    fn draw_vbo(&mut self, info: &DrawInfo) {
        self.draw(
            "draw_vbo",
            |rec| {
                rec.arg("info", TraceValue::from_serialize("pipe_draw_info", info));
            },
            |ctx| ctx.draw_vbo(info),
        );
    }

    fn clear(&mut self, flags: ClearFlags, color: [f32; 4], depth: f64, stencil: u32) {
        self.begin("clear")
            .arg("buffers", flags.bits())
            .arg("color", color)
            .arg("depth", depth)
            .arg("stencil", stencil);
        self.forward(|ctx| ctx.clear(flags, color, depth, stencil));
    }

    fn clear_render_target(&mut self, dst: Handle, color: [f32; 4], rect: Rect) {
        let Some(backend) = self.screen.unwrap_surface(Some(dst)) else {
            return;
        };
        self.begin("clear_render_target")
            .arg("dst", backend)
            .arg("color", color)
            .arg("rect", TraceValue::from_serialize("rect", &rect));
        self.forward(|ctx| ctx.clear_render_target(backend, color, rect));
    }

    fn clear_depth_stencil(
        &mut self,
        dst: Handle,
        flags: ClearFlags,
        depth: f64,
        stencil: u32,
        rect: Rect,
    ) {
        let Some(backend) = self.screen.unwrap_surface(Some(dst)) else {
            return;
        };
        self.begin("clear_depth_stencil")
            .arg("dst", backend)
            .arg("clear_flags", flags.bits())
            .arg("depth", depth)
            .arg("stencil", stencil)
            .arg("rect", TraceValue::from_serialize("rect", &rect));
        self.forward(|ctx| ctx.clear_depth_stencil(backend, flags, depth, stencil, rect));
    }

    fn resource_copy_region(
        &mut self,
        dst: Handle,
        dst_level: u32,
        dst_origin: [u32; 3],
        src: Handle,
        src_level: u32,
        src_box: &PipeBox,
    ) {
        let (Some(backend_dst), Some(backend_src)) = (
            self.screen.unwrap_resource(Some(dst)),
            self.screen.unwrap_resource(Some(src)),
        ) else {
            return;
        };
        self.begin("resource_copy_region")
            .arg("dst", backend_dst)
            .arg("dst_level", dst_level)
            .arg("dstx", dst_origin[0])
            .arg("dsty", dst_origin[1])
            .arg("dstz", dst_origin[2])
            .arg("src", backend_src)
            .arg("src_level", src_level)
            .arg("src_box", TraceValue::from_serialize("pipe_box", src_box));
        self.forward(|ctx| {
            ctx.resource_copy_region(
                backend_dst,
                dst_level,
                dst_origin,
                backend_src,
                src_level,
                src_box,
            )
        });
    }
}

impl Mappable for ProxyContext {
    fn transfer_map(
        &mut self,
        resource: Handle,
        level: u32,
        usage: TransferUsage,
        region: &PipeBox,
    ) -> Option<Transfer> {
        let backend_resource = self.screen.unwrap_resource(Some(resource))?;
        let mut rec = self.begin("transfer_map");
        rec.arg("resource", backend_resource)
            .arg("level", level)
            .arg("usage", TraceValue::from_enum(&usage))
            .arg("box", TraceValue::from_serialize("pipe_box", region));
        let transfer = self
            .forward(|ctx| ctx.transfer_map(backend_resource, level, usage, region))
            .flatten();
        rec.ret(transfer.map(|t| t.handle));
        rec.end();

        let transfer = transfer?;
        let id = self.screen.alloc_id();
        self.shared.state.lock().transfers.register(
            id,
            ProxyTransfer {
                backend: transfer.handle,
            },
        );
        Some(Transfer {
            handle: id,
            ..transfer
        })
    }

    fn transfer_read(&mut self, transfer: Handle) -> Result<Vec<u8>, BackendError> {
        let backend = self
            .transfer_backend(transfer)
            .ok_or(BackendError::UnknownObject(transfer))?;
        let mut rec = self.begin("transfer_read");
        rec.arg("transfer", backend);
        let res = self
            .forward(|ctx| ctx.transfer_read(backend))
            .unwrap_or_else(|| Err(BackendError::Other("context destroyed".into())));
        match &res {
            Ok(data) => rec.ret(data.len()),
            Err(err) => rec.ret(TraceValue::String(err.to_string())),
        };
        res
    }

    fn transfer_write(
        &mut self,
        transfer: Handle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let backend = self
            .transfer_backend(transfer)
            .ok_or(BackendError::UnknownObject(transfer))?;
        let mut rec = self.begin("transfer_write");
        rec.arg("transfer", backend)
            .arg("offset", offset)
            .arg("data", TraceValue::Bytes(data.to_vec()));
        let res = self
            .forward(|ctx| ctx.transfer_write(backend, offset, data))
            .unwrap_or_else(|| Err(BackendError::Other("context destroyed".into())));
        if let Err(err) = &res {
            rec.ret(TraceValue::String(err.to_string()));
        }
        res
    }

    fn transfer_flush_region(&mut self, transfer: Handle, region: &PipeBox) {
        let Some(backend) = self.transfer_backend(transfer) else {
            return;
        };
        self.begin("transfer_flush_region")
            .arg("transfer", backend)
            .arg("box", TraceValue::from_serialize("pipe_box", region));
        self.forward(|ctx| ctx.transfer_flush_region(backend, region));
    }

    fn transfer_unmap(&mut self, transfer: Handle) {
        let Some(backend) = self.transfer_backend(transfer) else {
            return;
        };
        self.begin("transfer_unmap").arg("transfer", backend);
        self.shared.state.lock().transfers.unregister(transfer);
        self.forward(|ctx| ctx.transfer_unmap(backend));
    }

    fn transfer_inline_write(
        &mut self,
        resource: Handle,
        level: u32,
        usage: TransferUsage,
        region: &PipeBox,
        data: &[u8],
        stride: u32,
        layer_stride: u32,
    ) {
        let Some(backend) = self.screen.unwrap_resource(Some(resource)) else {
            return;
        };
        self.begin("transfer_inline_write")
            .arg("resource", backend)
            .arg("level", level)
            .arg("usage", TraceValue::from_enum(&usage))
            .arg("box", TraceValue::from_serialize("pipe_box", region))
            .arg("data", TraceValue::Bytes(data.to_vec()))
            .arg("stride", stride)
            .arg("layer_stride", layer_stride);
        self.forward(|ctx| {
            ctx.transfer_inline_write(backend, level, usage, region, data, stride, layer_stride)
        });
    }

    fn redefine_user_buffer(&mut self, resource: Handle, offset: u32, size: u32) {
        let Some(proxy) = self.screen.resource(resource) else {
            tracing::debug!(%resource, "unknown resource");
            return;
        };
        if !proxy.user {
            tracing::warn!(%resource, "redefine_user_buffer on a non-user resource dropped");
            return;
        }
        self.begin("redefine_user_buffer")
            .arg("resource", proxy.backend)
            .arg("offset", offset)
            .arg("size", size);
        self.forward(|ctx| ctx.redefine_user_buffer(proxy.backend, offset, size));
    }
}

impl Context for ProxyContext {
    fn flush(&mut self) -> Option<Fence> {
        let mut rec = self.begin("flush");
        let fence = self.shared.flush();
        rec.ret(fence);
        fence
    }

    fn create_query(&mut self, query_type: QueryType) -> Option<Handle> {
        let mut rec = self.begin("create_query");
        rec.arg("query_type", TraceValue::from_enum(&query_type));
        let query = self.forward(|ctx| ctx.create_query(query_type)).flatten();
        rec.ret(query);
        query
    }

    fn destroy_query(&mut self, query: Handle) {
        self.begin("destroy_query").arg("query", query);
        self.forward(|ctx| ctx.destroy_query(query));
    }

    fn begin_query(&mut self, query: Handle) {
        self.begin("begin_query").arg("query", query);
        self.forward(|ctx| ctx.begin_query(query));
    }

    fn end_query(&mut self, query: Handle) {
        self.begin("end_query").arg("query", query);
        self.forward(|ctx| ctx.end_query(query));
    }

    fn get_query_result(
        &mut self,
        query: Handle,
        wait: bool,
    ) -> Result<Option<u64>, BackendError> {
        let mut rec = self.begin("get_query_result");
        rec.arg("query", query).arg("wait", wait);
        let res = self
            .forward(|ctx| ctx.get_query_result(query, wait))
            .unwrap_or_else(|| Err(BackendError::Other("context destroyed".into())));
        match &res {
            Ok(Some(v)) => rec.ret(*v),
            Ok(None) => rec.ret(TraceValue::null()),
            Err(err) => rec.ret(TraceValue::String(err.to_string())),
        };
        res
    }

    fn render_condition(&mut self, query: Option<Handle>, mode: RenderConditionMode) {
        self.begin("render_condition")
            .arg("query", query)
            .arg("mode", TraceValue::from_enum(&mode));
        self.forward(|ctx| ctx.render_condition(query, mode));
    }

    fn texture_barrier(&mut self) {
        self.begin("texture_barrier");
        self.forward(|ctx| ctx.texture_barrier());
    }
}

impl Drop for ProxyContext {
    fn drop(&mut self) {
        let id = self.shared.id;
        self.shared.gate.cancel();
        self.begin("destroy");
        {
            let mut objects = self.screen.objects.lock();
            objects.contexts.unregister(id);
            // Views die with the backend context that made them.
            let surfaces = objects.surfaces.unregister_where(|s| s.context == id);
            let views = objects.sampler_views.unregister_where(|v| v.context == id);
            if !surfaces.is_empty() || !views.is_empty() {
                tracing::debug!(context = %id, ?surfaces, ?views, "released context views");
            }
        }

        let backend = self.shared.backend.lock().take();
        drop(backend);
        tracing::debug!(context = %id, "context destroyed");
    }
}
