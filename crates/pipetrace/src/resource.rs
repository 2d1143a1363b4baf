//! Proxy object wrappers.
//!
//! Each wrapper owns exactly one backend handle and is known to the outside world only by its
//! proxy identity. Wrappers live in a [`crate::registry::Registry`]; removing them from it is
//! what ends their life.

use crate::pipe::{Handle, ResourceTemplate, ShaderSource, ShaderStage};

/// A buffer or texture.
#[derive(Debug, Clone)]
pub struct ProxyResource {
    pub backend: Handle,
    pub templ: ResourceTemplate,
    /// Created from caller memory with `user_buffer_create`.
    pub user: bool,
}

impl ProxyResource {
    pub fn is_texture(&self) -> bool {
        !self.templ.is_buffer()
    }
}

/// A render target view. Lives until destroyed or until the context that made it goes away.
#[derive(Debug, Clone, Copy)]
pub struct ProxySurface {
    pub backend: Handle,
    pub context: Handle,
}

#[derive(Debug, Clone, Copy)]
pub struct ProxySamplerView {
    pub backend: Handle,
    /// Proxy identity of the viewed resource, which is what bindings report.
    pub resource: Handle,
    pub context: Handle,
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyTransfer {
    pub backend: Handle,
}

/// Backend program installed in place of the original.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub backend: Handle,
    pub source: ShaderSource,
}

#[derive(Debug, Clone)]
pub struct ProxyShader {
    pub stage: ShaderStage,
    pub original: Handle,
    pub source: ShaderSource,
    pub replaced: Option<Replacement>,
    pub disabled: bool,
}

impl ProxyShader {
    pub fn new(stage: ShaderStage, original: Handle, source: ShaderSource) -> Self {
        Self {
            stage,
            original,
            source,
            replaced: None,
            disabled: false,
        }
    }

    /// The backend program a bind should forward: the replacement if one is installed.
    pub fn effective(&self) -> Handle {
        self.replaced
            .as_ref()
            .map_or(self.original, |r| r.backend)
    }
}
