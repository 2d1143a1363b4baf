use serde::Serialize;

/// Pixel formats understood by the proxy.
///
/// The proxy never converts pixel data; it only needs block geometry to size texture reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Format {
    None,
    B8G8R8A8Unorm,
    B8G8R8X8Unorm,
    R8G8B8A8Unorm,
    B5G6R5Unorm,
    A8Unorm,
    R8Unorm,
    R16Float,
    R32Float,
    R32G32B32A32Float,
    Z16Unorm,
    Z24UnormS8Uint,
    Z32Float,
    Bc1Rgba,
    Bc3Rgba,
}

impl Format {
    const ALL: [Format; 15] = [
        Format::None,
        Format::B8G8R8A8Unorm,
        Format::B8G8R8X8Unorm,
        Format::R8G8B8A8Unorm,
        Format::B5G6R5Unorm,
        Format::A8Unorm,
        Format::R8Unorm,
        Format::R16Float,
        Format::R32Float,
        Format::R32G32B32A32Float,
        Format::Z16Unorm,
        Format::Z24UnormS8Uint,
        Format::Z32Float,
        Format::Bc1Rgba,
        Format::Bc3Rgba,
    ];

    /// Stable numeric id used on the debug wire.
    pub fn as_u32(self) -> u32 {
        Self::ALL.iter().position(|f| *f == self).unwrap_or(0) as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub fn block_width(self) -> u32 {
        match self {
            Format::Bc1Rgba | Format::Bc3Rgba => 4,
            _ => 1,
        }
    }

    pub fn block_height(self) -> u32 {
        self.block_width()
    }

    /// Bytes per block (per pixel for uncompressed formats).
    pub fn block_size(self) -> u32 {
        match self {
            Format::None => 0,
            Format::A8Unorm | Format::R8Unorm => 1,
            Format::B5G6R5Unorm | Format::R16Float | Format::Z16Unorm => 2,
            Format::B8G8R8A8Unorm
            | Format::B8G8R8X8Unorm
            | Format::R8G8B8A8Unorm
            | Format::R32Float
            | Format::Z24UnormS8Uint
            | Format::Z32Float => 4,
            Format::Bc1Rgba => 8,
            Format::Bc3Rgba | Format::R32G32B32A32Float => 16,
        }
    }

    pub fn is_depth_stencil(self) -> bool {
        matches!(
            self,
            Format::Z16Unorm | Format::Z24UnormS8Uint | Format::Z32Float
        )
    }

    pub fn nblocksx(self, width: u32) -> u32 {
        let bw = self.block_width();
        width.div_ceil(bw)
    }

    pub fn nblocksy(self, height: u32) -> u32 {
        let bh = self.block_height();
        height.div_ceil(bh)
    }

    /// Row pitch of a tightly packed region `width` pixels wide.
    pub fn stride(self, width: u32) -> u32 {
        self.nblocksx(width).saturating_mul(self.block_size())
    }
}
