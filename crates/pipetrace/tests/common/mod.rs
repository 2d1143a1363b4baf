#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pipetrace::pipe::{
    BackendError, BindFlags, BlendState, ClearFlags, ClipState, Context, DepthStencilAlphaState,
    DrawInfo, Drawable, Fence, Format, FramebufferState, Handle, IndexBuffer, Mappable, PipeBox,
    PolyStipple, PrimitiveType, QueryType, RasterizerState, Rect, RenderConditionMode,
    ResourceTemplate, SamplerState, SamplerViewTemplate, ScissorState, Screen, ScreenCap,
    ScreenCapF, ShaderSource, ShaderStage, StateBinder, StencilRef, SurfaceTemplate,
    TextureTarget, Transfer, TransferUsage, VertexBuffer, VertexElement, ViewportState,
};
use pipetrace::{DebugServerConfig, TraceConfig};

/// Shader sources containing this marker fail to compile.
pub const BAD_SHADER: &str = "syntax error";

struct FakeResource {
    templ: ResourceTemplate,
    data: Vec<u8>,
}

struct FakeTransfer {
    resource: Handle,
    region: PipeBox,
    stride: u32,
}

#[derive(Default)]
struct FakeState {
    next: u64,
    calls: Vec<String>,
    resources: HashMap<Handle, FakeResource>,
    transfers: HashMap<Handle, FakeTransfer>,
    shaders: HashMap<Handle, ShaderSource>,
    live_contexts: usize,
}

impl FakeState {
    fn alloc(&mut self) -> Handle {
        self.next += 1;
        Handle(0x1000 + self.next)
    }

    fn log(&mut self, call: String) {
        self.calls.push(call);
    }
}

/// Backend call log plus the objects the fake backend has handed out.
///
/// Backend handles start at `0x1001` so they never collide with proxy identities in a test.
#[derive(Clone, Default)]
pub struct FakeLog(Arc<Mutex<FakeState>>);

impl FakeLog {
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().calls.clear();
    }

    pub fn live_resources(&self) -> usize {
        self.0.lock().resources.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.0.lock().shaders.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.0.lock().live_contexts
    }

    pub fn shader_source(&self, shader: Handle) -> Option<String> {
        self.0
            .lock()
            .shaders
            .get(&shader)
            .map(|s| s.as_str().to_owned())
    }

    /// Overwrite the level 0 contents of a backend resource.
    pub fn fill(&self, resource: Handle, data: &[u8]) {
        let mut state = self.0.lock();
        let res = state.resources.get_mut(&resource).expect("unknown resource");
        res.data[..data.len()].copy_from_slice(data);
    }
}

pub struct FakeScreen {
    log: FakeLog,
}

impl FakeScreen {
    pub fn new() -> (Arc<Self>, FakeLog) {
        let log = FakeLog::default();
        (Arc::new(Self { log: log.clone() }), log)
    }

    fn state(&self) -> parking_lot::MutexGuard<'_, FakeState> {
        self.log.0.lock()
    }
}

fn level0_size(templ: &ResourceTemplate) -> usize {
    let [w, h, d] = templ.level_extent(0);
    templ.format.stride(w) as usize
        * templ.format.nblocksy(h) as usize
        * d.max(templ.array_size) as usize
}

impl Screen for FakeScreen {
    fn name(&self) -> String {
        "fake".to_owned()
    }

    fn vendor(&self) -> String {
        "pipetrace tests".to_owned()
    }

    fn param(&self, cap: ScreenCap) -> i32 {
        match cap {
            ScreenCap::MaxTextureImageUnits => 16,
            ScreenCap::MaxRenderTargets => 8,
            _ => 1,
        }
    }

    fn paramf(&self, _cap: ScreenCapF) -> f32 {
        1.0
    }

    fn is_format_supported(
        &self,
        format: Format,
        _target: TextureTarget,
        _sample_count: u32,
        bind: BindFlags,
    ) -> bool {
        !(format.is_depth_stencil() && bind.contains(BindFlags::RENDER_TARGET))
    }

    fn create_context(&self) -> Option<Box<dyn Context>> {
        let mut state = self.state();
        let id = state.alloc();
        state.live_contexts += 1;
        state.log(format!("context_create {id}"));
        Some(Box::new(FakeContext {
            log: self.log.clone(),
            id,
            programs: [None; 2],
            next_fence: 0,
        }))
    }

    fn resource_create(&self, templ: &ResourceTemplate) -> Option<Handle> {
        if templ.width == 0 {
            return None;
        }
        let mut state = self.state();
        let id = state.alloc();
        state.log(format!("resource_create {id} {}x{}", templ.width, templ.height));
        state.resources.insert(
            id,
            FakeResource {
                templ: *templ,
                data: vec![0; level0_size(templ)],
            },
        );
        Some(id)
    }

    fn user_buffer_create(&self, data: &[u8], bind: BindFlags) -> Option<Handle> {
        let mut state = self.state();
        let id = state.alloc();
        state.log(format!("user_buffer_create {id} {}", data.len()));
        state.resources.insert(
            id,
            FakeResource {
                templ: ResourceTemplate::buffer(data.len() as u32, bind),
                data: data.to_vec(),
            },
        );
        Some(id)
    }

    fn resource_destroy(&self, resource: Handle) {
        let mut state = self.state();
        assert!(
            state.resources.remove(&resource).is_some(),
            "double destroy of {resource}"
        );
        state.log(format!("resource_destroy {resource}"));
    }

    fn flush_frontbuffer(&self, resource: Handle, level: u32, layer: u32) {
        self.state()
            .log(format!("flush_frontbuffer {resource} {level} {layer}"));
    }

    fn fence_finish(&self, fence: Fence, _timeout_ns: u64) -> bool {
        self.state().log(format!("fence_finish {}", fence.0));
        true
    }

    fn fence_destroy(&self, fence: Fence) {
        self.state().log(format!("fence_destroy {}", fence.0));
    }
}

pub struct FakeContext {
    log: FakeLog,
    id: Handle,
    programs: [Option<Handle>; 2],
    next_fence: u64,
}

impl FakeContext {
    fn log(&self, call: String) {
        self.log.0.lock().log(call);
    }

    fn alloc(&self) -> Handle {
        self.log.0.lock().alloc()
    }

    fn programs(&self) -> String {
        format!(
            "vs={:?} fs={:?}",
            self.programs[0].map(Handle::get),
            self.programs[1].map(Handle::get)
        )
    }
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        let mut state = self.log.0.lock();
        state.live_contexts -= 1;
        state.log(format!("context_destroy {}", self.id));
    }
}

impl StateBinder for FakeContext {
    fn create_blend_state(&mut self, _state: &BlendState) -> Option<Handle> {
        let id = self.alloc();
        self.log(format!("create_blend_state {id}"));
        Some(id)
    }

    fn bind_blend_state(&mut self, state: Option<Handle>) {
        self.log(format!("bind_blend_state {state:?}"));
    }

    fn delete_blend_state(&mut self, state: Handle) {
        self.log(format!("delete_blend_state {state}"));
    }

    fn create_sampler_state(&mut self, _state: &SamplerState) -> Option<Handle> {
        let id = self.alloc();
        self.log(format!("create_sampler_state {id}"));
        Some(id)
    }

    fn bind_sampler_states(&mut self, stage: ShaderStage, states: &[Option<Handle>]) {
        self.log(format!("bind_sampler_states {stage:?} {states:?}"));
    }

    fn delete_sampler_state(&mut self, state: Handle) {
        self.log(format!("delete_sampler_state {state}"));
    }

    fn create_rasterizer_state(&mut self, _state: &RasterizerState) -> Option<Handle> {
        let id = self.alloc();
        self.log(format!("create_rasterizer_state {id}"));
        Some(id)
    }

    fn bind_rasterizer_state(&mut self, state: Option<Handle>) {
        self.log(format!("bind_rasterizer_state {state:?}"));
    }

    fn delete_rasterizer_state(&mut self, state: Handle) {
        self.log(format!("delete_rasterizer_state {state}"));
    }

    fn create_depth_stencil_alpha_state(
        &mut self,
        _state: &DepthStencilAlphaState,
    ) -> Option<Handle> {
        let id = self.alloc();
        self.log(format!("create_depth_stencil_alpha_state {id}"));
        Some(id)
    }

    fn bind_depth_stencil_alpha_state(&mut self, state: Option<Handle>) {
        self.log(format!("bind_depth_stencil_alpha_state {state:?}"));
    }

    fn delete_depth_stencil_alpha_state(&mut self, state: Handle) {
        self.log(format!("delete_depth_stencil_alpha_state {state}"));
    }

    fn create_vertex_elements_state(&mut self, elements: &[VertexElement]) -> Option<Handle> {
        let id = self.alloc();
        self.log(format!("create_vertex_elements_state {id} {}", elements.len()));
        Some(id)
    }

    fn bind_vertex_elements_state(&mut self, state: Option<Handle>) {
        self.log(format!("bind_vertex_elements_state {state:?}"));
    }

    fn delete_vertex_elements_state(&mut self, state: Handle) {
        self.log(format!("delete_vertex_elements_state {state}"));
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &ShaderSource) -> Option<Handle> {
        if source.as_str().contains(BAD_SHADER) {
            self.log(format!("create_shader {stage:?} rejected"));
            return None;
        }
        let mut state = self.log.0.lock();
        let id = state.alloc();
        state.shaders.insert(id, source.clone());
        state.log(format!("create_shader {stage:?} {id}"));
        Some(id)
    }

    fn bind_shader(&mut self, stage: ShaderStage, shader: Option<Handle>) {
        self.programs[stage.index()] = shader;
        self.log(format!("bind_shader {stage:?} {:?}", shader.map(Handle::get)));
    }

    fn delete_shader(&mut self, stage: ShaderStage, shader: Handle) {
        let mut state = self.log.0.lock();
        assert!(
            state.shaders.remove(&shader).is_some(),
            "double delete of shader {shader}"
        );
        state.log(format!("delete_shader {stage:?} {shader}"));
    }

    fn set_blend_color(&mut self, color: [f32; 4]) {
        self.log(format!("set_blend_color {color:?}"));
    }

    fn set_stencil_ref(&mut self, stencil_ref: &StencilRef) {
        self.log(format!("set_stencil_ref {stencil_ref:?}"));
    }

    fn set_clip_state(&mut self, _clip: &ClipState) {
        self.log("set_clip_state".to_owned());
    }

    fn set_sample_mask(&mut self, mask: u32) {
        self.log(format!("set_sample_mask {mask:#x}"));
    }

    fn set_constant_buffer(&mut self, stage: ShaderStage, index: u32, buffer: Option<Handle>) {
        self.log(format!(
            "set_constant_buffer {stage:?} {index} {:?}",
            buffer.map(Handle::get)
        ));
    }

    fn set_framebuffer_state(&mut self, fb: &FramebufferState) {
        let cbufs: Vec<Option<u64>> = fb.cbufs.iter().map(|s| s.map(Handle::get)).collect();
        self.log(format!(
            "set_framebuffer_state cbufs={cbufs:?} zsbuf={:?}",
            fb.zsbuf.map(Handle::get)
        ));
    }

    fn set_scissor_state(&mut self, _scissor: &ScissorState) {
        self.log("set_scissor_state".to_owned());
    }

    fn set_viewport_state(&mut self, _viewport: &ViewportState) {
        self.log("set_viewport_state".to_owned());
    }

    fn set_sampler_textures(&mut self, stage: ShaderStage, textures: &[Option<Handle>]) {
        let ids: Vec<Option<u64>> = textures.iter().map(|t| t.map(Handle::get)).collect();
        self.log(format!("set_sampler_textures {stage:?} {ids:?}"));
    }

    fn set_vertex_buffers(&mut self, buffers: &[VertexBuffer]) {
        let ids: Vec<Option<u64>> = buffers.iter().map(|b| b.buffer.map(Handle::get)).collect();
        self.log(format!("set_vertex_buffers {ids:?}"));
    }

    fn set_index_buffer(&mut self, buffer: Option<&IndexBuffer>) {
        self.log(format!(
            "set_index_buffer {:?}",
            buffer.and_then(|ib| ib.buffer).map(Handle::get)
        ));
    }

    fn set_polygon_stipple(&mut self, stipple: &PolyStipple) {
        self.log(format!("set_polygon_stipple {:#x}", stipple.stipple[0]));
    }

    fn create_sampler_view(
        &mut self,
        resource: Handle,
        templ: &SamplerViewTemplate,
    ) -> Option<Handle> {
        let mut state = self.log.0.lock();
        if !state.resources.contains_key(&resource) {
            return None;
        }
        let id = state.alloc();
        state.log(format!(
            "create_sampler_view {id} {resource} levels={}..={}",
            templ.first_level, templ.last_level
        ));
        Some(id)
    }

    fn sampler_view_destroy(&mut self, view: Handle) {
        self.log(format!("sampler_view_destroy {view}"));
    }

    fn set_sampler_views(&mut self, stage: ShaderStage, views: &[Option<Handle>]) {
        let ids: Vec<Option<u64>> = views.iter().map(|v| v.map(Handle::get)).collect();
        self.log(format!("set_sampler_views {stage:?} {ids:?}"));
    }

    fn create_surface(&mut self, resource: Handle, _templ: &SurfaceTemplate) -> Option<Handle> {
        let mut state = self.log.0.lock();
        if !state.resources.contains_key(&resource) {
            return None;
        }
        let id = state.alloc();
        state.log(format!("create_surface {id} {resource}"));
        Some(id)
    }

    fn surface_destroy(&mut self, surface: Handle) {
        self.log(format!("surface_destroy {surface}"));
    }
}

impl Drawable for FakeContext {
    fn draw_arrays(&mut self, mode: PrimitiveType, start: u32, count: u32) {
        self.log(format!(
            "draw_arrays {mode:?} {start} {count} {}",
            self.programs()
        ));
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
        self.log(format!(
            "draw_elements {index_buffer} {index_size} {index_bias} {mode:?} {start} {count} {}",
            self.programs()
        ));
    }

    fn draw_vbo(&mut self, info: &DrawInfo) {
        self.log(format!(
            "draw_vbo {:?} {} {} {}",
            info.mode,
            info.start,
            info.count,
            self.programs()
        ));
    }

    fn clear(&mut self, flags: ClearFlags, _color: [f32; 4], _depth: f64, _stencil: u32) {
        self.log(format!("clear {:#x}", flags.bits()));
    }

    fn clear_render_target(&mut self, dst: Handle, _color: [f32; 4], _rect: Rect) {
        self.log(format!("clear_render_target {dst}"));
    }

    fn clear_depth_stencil(
        &mut self,
        dst: Handle,
        _flags: ClearFlags,
        _depth: f64,
        _stencil: u32,
        _rect: Rect,
    ) {
        self.log(format!("clear_depth_stencil {dst}"));
    }

    fn resource_copy_region(
        &mut self,
        dst: Handle,
        _dst_level: u32,
        _dst_origin: [u32; 3],
        src: Handle,
        _src_level: u32,
        _src_box: &PipeBox,
    ) {
        self.log(format!("resource_copy_region {dst} {src}"));
    }
}

impl Mappable for FakeContext {
    fn transfer_map(
        &mut self,
        resource: Handle,
        level: u32,
        usage: TransferUsage,
        region: &PipeBox,
    ) -> Option<Transfer> {
        let mut state = self.log.0.lock();
        let templ = state.resources.get(&resource)?.templ;
        let stride = templ.format.stride(region.width);
        let id = state.alloc();
        state.transfers.insert(
            id,
            FakeTransfer {
                resource,
                region: *region,
                stride,
            },
        );
        state.log(format!(
            "transfer_map {id} {resource} {level} {:#x}",
            usage.bits()
        ));
        Some(Transfer {
            handle: id,
            stride,
            layer_stride: stride * templ.format.nblocksy(region.height),
        })
    }

    fn transfer_read(&mut self, transfer: Handle) -> Result<Vec<u8>, BackendError> {
        let mut state = self.log.0.lock();
        let t = state
            .transfers
            .get(&transfer)
            .ok_or(BackendError::UnknownObject(transfer))?;
        let res = &state.resources[&t.resource];
        let format = res.templ.format;
        let [width, _, _] = res.templ.level_extent(0);
        let row_pitch = format.stride(width) as usize;
        let x_off = format.stride(t.region.x) as usize;
        let mut out = Vec::new();
        for row in 0..format.nblocksy(t.region.height) {
            let y = (format.nblocksy(t.region.y) + row) as usize;
            let start = y * row_pitch + x_off;
            let end = start + t.stride as usize;
            let src = res.data.get(start..end).ok_or(BackendError::OutOfBounds {
                offset: start,
                len: t.stride as usize,
                size: res.data.len(),
            })?;
            out.extend_from_slice(src);
        }
        state.log(format!("transfer_read {transfer} {}", out.len()));
        Ok(out)
    }

    fn transfer_write(
        &mut self,
        transfer: Handle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.log.0.lock();
        let resource = state
            .transfers
            .get(&transfer)
            .ok_or(BackendError::UnknownObject(transfer))?
            .resource;
        let res = state
            .resources
            .get_mut(&resource)
            .ok_or(BackendError::UnknownObject(resource))?;
        let size = res.data.len();
        let dst = res
            .data
            .get_mut(offset..offset + data.len())
            .ok_or(BackendError::OutOfBounds {
                offset,
                len: data.len(),
                size,
            })?;
        dst.copy_from_slice(data);
        state.log(format!("transfer_write {transfer} {offset} {}", data.len()));
        Ok(())
    }

    fn transfer_flush_region(&mut self, transfer: Handle, _region: &PipeBox) {
        self.log(format!("transfer_flush_region {transfer}"));
    }

    fn transfer_unmap(&mut self, transfer: Handle) {
        let mut state = self.log.0.lock();
        assert!(
            state.transfers.remove(&transfer).is_some(),
            "double unmap of {transfer}"
        );
        state.log(format!("transfer_unmap {transfer}"));
    }

    fn transfer_inline_write(
        &mut self,
        resource: Handle,
        level: u32,
        _usage: TransferUsage,
        region: &PipeBox,
        data: &[u8],
        stride: u32,
        _layer_stride: u32,
    ) {
        let mut state = self.log.0.lock();
        if let Some(res) = state.resources.get_mut(&resource) {
            let format = res.templ.format;
            let [width, _, _] = res.templ.level_extent(0);
            let row_pitch = format.stride(width) as usize;
            let row_len = format.stride(region.width) as usize;
            let x_off = format.stride(region.x) as usize;
            for row in 0..format.nblocksy(region.height) as usize {
                let y = format.nblocksy(region.y) as usize + row;
                let dst = y * row_pitch + x_off;
                let src = row * stride as usize;
                res.data[dst..dst + row_len].copy_from_slice(&data[src..src + row_len]);
            }
        }
        state.log(format!(
            "transfer_inline_write {resource} {level} {}",
            data.len()
        ));
    }

    fn redefine_user_buffer(&mut self, resource: Handle, offset: u32, size: u32) {
        self.log(format!("redefine_user_buffer {resource} {offset} {size}"));
    }
}

impl Context for FakeContext {
    fn flush(&mut self) -> Option<Fence> {
        self.next_fence += 1;
        self.log(format!("flush {}", self.next_fence));
        Some(Fence(self.next_fence))
    }

    fn create_query(&mut self, query_type: QueryType) -> Option<Handle> {
        let id = self.alloc();
        self.log(format!("create_query {id} {query_type:?}"));
        Some(id)
    }

    fn destroy_query(&mut self, query: Handle) {
        self.log(format!("destroy_query {query}"));
    }

    fn begin_query(&mut self, query: Handle) {
        self.log(format!("begin_query {query}"));
    }

    fn end_query(&mut self, query: Handle) {
        self.log(format!("end_query {query}"));
    }

    fn get_query_result(
        &mut self,
        query: Handle,
        wait: bool,
    ) -> Result<Option<u64>, BackendError> {
        self.log(format!("get_query_result {query} {wait}"));
        Ok(wait.then_some(42))
    }

    fn render_condition(&mut self, query: Option<Handle>, mode: RenderConditionMode) {
        self.log(format!(
            "render_condition {:?} {mode:?}",
            query.map(Handle::get)
        ));
    }

    fn texture_barrier(&mut self) {
        self.log("texture_barrier".to_owned());
    }
}

/// Tracing on, records written to `path`, no debug server.
pub fn file_config(path: &std::path::Path) -> TraceConfig {
    TraceConfig::to_file(path)
}

/// Tracing on, records discarded, debug server on an OS-assigned loopback port.
pub fn debug_config() -> TraceConfig {
    TraceConfig {
        enabled: true,
        output: None,
        initial_blocker: Default::default(),
        debug_server: Some(DebugServerConfig {
            poll_interval: Duration::from_millis(5),
            ..DebugServerConfig::ephemeral()
        }),
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

pub fn rgba_texture(width: u32, height: u32) -> ResourceTemplate {
    ResourceTemplate::texture_2d(Format::R8G8B8A8Unorm, width, height, 0)
}
