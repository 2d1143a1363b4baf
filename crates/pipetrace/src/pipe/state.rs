//! Descriptor types passed across the capability surface.
//!
//! Everything here is plain data. All of it derives `Serialize` so the call recorder can dump it
//! as a `<struct>` without per-type code.

use serde::Serialize;

use super::{Format, Handle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TextureTarget {
    Buffer,
    Texture1D,
    Texture2D,
    Texture3D,
    TextureCube,
    TextureRect,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
    pub struct BindFlags: u32 {
        const DEPTH_STENCIL = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const SAMPLER_VIEW = 1 << 3;
        const VERTEX_BUFFER = 1 << 4;
        const INDEX_BUFFER = 1 << 5;
        const CONSTANT_BUFFER = 1 << 6;
        const DISPLAY_TARGET = 1 << 8;
        const TRANSFER_WRITE = 1 << 9;
        const TRANSFER_READ = 1 << 10;
        const SCANOUT = 1 << 14;
        const SHARED = 1 << 15;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
    pub struct ClearFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
        const DEPTHSTENCIL = Self::DEPTH.bits() | Self::STENCIL.bits();
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
    pub struct TransferUsage: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DISCARD = 1 << 8;
        const DONTBLOCK = 1 << 9;
        const UNSYNCHRONIZED = 1 << 10;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceUsage {
    #[default]
    Default,
    Dynamic,
    Immutable,
    Staging,
}

/// Creation template for buffers and textures. These are the external-facing fields every
/// resource wrapper copies from its backend object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceTemplate {
    pub target: TextureTarget,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub usage: ResourceUsage,
    pub bind: BindFlags,
    pub flags: u32,
}

impl ResourceTemplate {
    pub fn buffer(size: u32, bind: BindFlags) -> Self {
        Self {
            target: TextureTarget::Buffer,
            format: Format::R8Unorm,
            width: size,
            height: 1,
            depth: 1,
            array_size: 1,
            last_level: 0,
            nr_samples: 0,
            usage: ResourceUsage::Default,
            bind,
            flags: 0,
        }
    }

    pub fn texture_2d(format: Format, width: u32, height: u32, last_level: u32) -> Self {
        Self {
            target: TextureTarget::Texture2D,
            format,
            width,
            height,
            depth: 1,
            array_size: 1,
            last_level,
            nr_samples: 0,
            usage: ResourceUsage::Default,
            bind: BindFlags::SAMPLER_VIEW | BindFlags::RENDER_TARGET,
            flags: 0,
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.target == TextureTarget::Buffer
    }

    /// Size of mip `level` as `[width, height, depth]`, clamped to at least one texel.
    pub fn level_extent(&self, level: u32) -> [u32; 3] {
        let minify = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
        let depth = if self.target == TextureTarget::Texture3D {
            minify(self.depth)
        } else {
            self.depth.max(1)
        };
        [minify(self.width), minify(self.height), depth]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct PipeBox {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl PipeBox {
    pub fn new_2d(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            z: 0,
            width,
            height,
            depth: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A mapped transfer as reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub handle: Handle,
    pub stride: u32,
    pub layer_stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SurfaceTemplate {
    pub format: Format,
    pub level: u32,
    pub first_layer: u32,
    pub last_layer: u32,
    pub usage: BindFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Swizzle {
    #[default]
    Red,
    Green,
    Blue,
    Alpha,
    Zero,
    One,
}

/// How a shader samples a resource through a sampler view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SamplerViewTemplate {
    pub format: Format,
    pub first_level: u32,
    pub last_level: u32,
    pub swizzle: [Swizzle; 4],
}

impl SamplerViewTemplate {
    /// Identity view of every level of `templ`.
    pub fn for_resource(templ: &ResourceTemplate) -> Self {
        Self {
            format: templ.format,
            first_level: 0,
            last_level: templ.last_level,
            swizzle: [Swizzle::Red, Swizzle::Green, Swizzle::Blue, Swizzle::Alpha],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum BlendFunc {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum BlendFactor {
    #[default]
    One,
    Zero,
    SrcColor,
    SrcAlpha,
    DstColor,
    DstAlpha,
    ConstColor,
    InvSrcColor,
    InvSrcAlpha,
    InvDstColor,
    InvDstAlpha,
    InvConstColor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RtBlendState {
    pub blend_enable: bool,
    pub rgb_func: BlendFunc,
    pub rgb_src_factor: BlendFactor,
    pub rgb_dst_factor: BlendFactor,
    pub alpha_func: BlendFunc,
    pub alpha_src_factor: BlendFactor,
    pub alpha_dst_factor: BlendFactor,
    pub colormask: u8,
}

impl Default for RtBlendState {
    fn default() -> Self {
        Self {
            blend_enable: false,
            rgb_func: BlendFunc::Add,
            rgb_src_factor: BlendFactor::One,
            rgb_dst_factor: BlendFactor::Zero,
            alpha_func: BlendFunc::Add,
            alpha_src_factor: BlendFactor::One,
            alpha_dst_factor: BlendFactor::Zero,
            colormask: 0xf,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BlendState {
    pub independent_blend_enable: bool,
    pub dither: bool,
    pub rt: Vec<RtBlendState>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum CullFace {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct RasterizerState {
    pub flatshade: bool,
    pub light_twoside: bool,
    pub front_ccw: bool,
    pub cull_face: CullFace,
    pub fill_front: PolygonMode,
    pub fill_back: PolygonMode,
    pub scissor: bool,
    pub multisample: bool,
    pub line_width: f32,
    pub point_size: f32,
    pub offset_units: f32,
    pub offset_scale: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DepthState {
    pub enabled: bool,
    pub writemask: bool,
    pub func: CompareFunc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    Incr,
    Decr,
    IncrWrap,
    DecrWrap,
    Invert,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StencilState {
    pub enabled: bool,
    pub func: CompareFunc,
    pub fail_op: StencilOp,
    pub zpass_op: StencilOp,
    pub zfail_op: StencilOp,
    pub valuemask: u8,
    pub writemask: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct AlphaState {
    pub enabled: bool,
    pub func: CompareFunc,
    pub ref_value: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct DepthStencilAlphaState {
    pub depth: DepthState,
    pub stencil: [StencilState; 2],
    pub alpha: AlphaState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum WrapMode {
    #[default]
    Repeat,
    ClampToEdge,
    ClampToBorder,
    MirrorRepeat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum MipFilter {
    #[default]
    None,
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SamplerState {
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub wrap_r: WrapMode,
    pub min_img_filter: Filter,
    pub mag_img_filter: Filter,
    pub min_mip_filter: MipFilter,
    pub compare_mode: bool,
    pub compare_func: CompareFunc,
    pub normalized_coords: bool,
    pub max_anisotropy: u32,
    pub lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: [f32; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VertexElement {
    pub src_offset: u32,
    pub instance_divisor: u32,
    pub vertex_buffer_index: u32,
    pub src_format: Format,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VertexBuffer {
    pub stride: u32,
    pub buffer_offset: u32,
    pub buffer: Option<Handle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IndexBuffer {
    pub index_size: u32,
    pub offset: u32,
    pub buffer: Option<Handle>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FramebufferState {
    pub width: u32,
    pub height: u32,
    pub cbufs: Vec<Option<Handle>>,
    pub zsbuf: Option<Handle>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScissorState {
    pub minx: u32,
    pub miny: u32,
    pub maxx: u32,
    pub maxy: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ViewportState {
    pub scale: [f32; 4],
    pub translate: [f32; 4],
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClipState {
    pub ucp: Vec<[f32; 4]>,
    pub depth_clamp: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StencilRef {
    pub ref_value: [u8; 2],
}

/// 32x32 polygon stipple pattern, one row per word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PolyStipple {
    pub stipple: [u32; 32],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum RenderConditionMode {
    #[default]
    Wait,
    NoWait,
    ByRegionWait,
    ByRegionNoWait,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveType {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    #[default]
    Triangles,
    TriangleStrip,
    TriangleFan,
    Quads,
    QuadStrip,
    Polygon,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrawInfo {
    pub indexed: bool,
    pub mode: PrimitiveType,
    pub start: u32,
    pub count: u32,
    pub start_instance: u32,
    pub instance_count: u32,
    pub index_bias: i32,
    pub min_index: u32,
    pub max_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 2] = [ShaderStage::Vertex, ShaderStage::Fragment];

    pub fn index(self) -> usize {
        match self {
            ShaderStage::Vertex => 0,
            ShaderStage::Fragment => 1,
        }
    }

    pub fn as_u32(self) -> u32 {
        self.index() as u32
    }
}

/// Textual shader program handed to the backend compiler.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ShaderSource(String);

impl ShaderSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ShaderSource {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum QueryType {
    OcclusionCounter,
    OcclusionPredicate,
    Timestamp,
    TimeElapsed,
    PrimitivesGenerated,
    PrimitivesEmitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ScreenCap {
    MaxTextureImageUnits,
    MaxVertexTextureUnits,
    MaxTexture2dLevels,
    MaxTexture3dLevels,
    MaxTextureCubeLevels,
    MaxRenderTargets,
    NpotTextures,
    OcclusionQuery,
    TimerQuery,
    TextureShadowMap,
    TwoSidedStencil,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ScreenCapF {
    MaxLineWidth,
    MaxPointWidth,
    MaxTextureAnisotropy,
    MaxTextureLodBias,
}
