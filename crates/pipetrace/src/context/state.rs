use crate::pipe::{Handle, ShaderStage};

/// What a context currently has bound, in proxy identities.
///
/// Mutated only by the forwarding bind/set calls. Draws take a copy before evaluating draw rules,
/// and the debug server reads it for `CONTEXT_INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundState {
    shaders: [Option<Handle>; 2],
    sampler_textures: [Vec<Option<Handle>>; 2],
    pub cbufs: Vec<Option<Handle>>,
    pub zsbuf: Option<Handle>,
}

impl BoundState {
    pub fn shader(&self, stage: ShaderStage) -> Option<Handle> {
        self.shaders[stage.index()]
    }

    pub fn set_shader(&mut self, stage: ShaderStage, shader: Option<Handle>) {
        self.shaders[stage.index()] = shader;
    }

    pub fn textures(&self, stage: ShaderStage) -> &[Option<Handle>] {
        &self.sampler_textures[stage.index()]
    }

    pub fn set_textures(&mut self, stage: ShaderStage, textures: Vec<Option<Handle>>) {
        self.sampler_textures[stage.index()] = textures;
    }

    pub fn is_texture_bound(&self, texture: Handle) -> bool {
        self.sampler_textures
            .iter()
            .flatten()
            .any(|t| *t == Some(texture))
    }

    pub fn is_surface_bound(&self, surface: Handle) -> bool {
        self.zsbuf == Some(surface) || self.cbufs.contains(&Some(surface))
    }

    /// Which stages currently have `shader` bound.
    pub fn stages_bound_to(&self, shader: Handle) -> impl Iterator<Item = ShaderStage> + '_ {
        ShaderStage::ALL
            .into_iter()
            .filter(move |stage| self.shader(*stage) == Some(shader))
    }
}
