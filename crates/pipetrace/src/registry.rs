use std::collections::BTreeMap;

use crate::pipe::Handle;

/// Classes of live proxy objects. Each class has its own [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Buffer,
    Texture,
    Surface,
    SamplerView,
    Context,
    Transfer,
    Shader,
}

impl ResourceClass {
    pub fn name(self) -> &'static str {
        match self {
            ResourceClass::Buffer => "buffer",
            ResourceClass::Texture => "texture",
            ResourceClass::Surface => "surface",
            ResourceClass::SamplerView => "sampler_view",
            ResourceClass::Context => "context",
            ResourceClass::Transfer => "transfer",
            ResourceClass::Shader => "shader",
        }
    }
}

/// Live objects of one class keyed by proxy identity.
///
/// Proxy identities come from a monotonically increasing counter, so key order is creation order
/// and [`Registry::list`] enumerates in insertion order. The registry itself is not synchronised;
/// its owner keeps it behind the screen (or context) mutex and copies identities out with
/// [`Registry::list`] before doing anything slow.
#[derive(Debug)]
pub struct Registry<T> {
    class: ResourceClass,
    entries: BTreeMap<Handle, T>,
}

impl<T> Registry<T> {
    pub fn new(class: ResourceClass) -> Self {
        Self {
            class,
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, id: Handle, value: T) {
        let previous = self.entries.insert(id, value);
        debug_assert!(
            previous.is_none(),
            "{} {id} registered twice",
            self.class.name()
        );
    }

    /// Removes `id`, returning the object if it was live.
    pub fn unregister(&mut self, id: Handle) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: Handle) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: Handle) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Point-in-time copy of the live identities, in creation order.
    pub fn list(&self) -> Vec<Handle> {
        self.entries.keys().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Removes every entry matching `pred`, returning the removed identities in creation order.
    pub fn unregister_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<Handle> {
        let doomed: Vec<Handle> = self
            .entries
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.entries.remove(id);
        }
        doomed
    }
}
