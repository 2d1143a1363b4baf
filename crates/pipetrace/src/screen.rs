//! Proxy screen: the entry point that wraps a backend device.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TraceConfig;
use crate::context::block::BlockFlags;
use crate::context::{ContextShared, ProxyContext};
use crate::debug::{DebugEvent, DebugServer, DebugServerError};
use crate::pipe::{
    BindFlags, Context, Fence, Format, Handle, ResourceTemplate, Screen, ScreenCap, ScreenCapF,
    TextureTarget,
};
use crate::registry::{Registry, ResourceClass};
use crate::resource::{ProxyResource, ProxySamplerView, ProxySurface};
use crate::trace::{CallRecord, TraceError, TraceValue, TraceWriter};

/// Screen-wide registries, all behind one lock.
pub(crate) struct ScreenObjects {
    pub(crate) buffers: Registry<ProxyResource>,
    pub(crate) textures: Registry<ProxyResource>,
    pub(crate) surfaces: Registry<ProxySurface>,
    pub(crate) sampler_views: Registry<ProxySamplerView>,
    pub(crate) contexts: Registry<Arc<ContextShared>>,
}

impl ScreenObjects {
    fn new() -> Self {
        Self {
            buffers: Registry::new(ResourceClass::Buffer),
            textures: Registry::new(ResourceClass::Texture),
            surfaces: Registry::new(ResourceClass::Surface),
            sampler_views: Registry::new(ResourceClass::SamplerView),
            contexts: Registry::new(ResourceClass::Context),
        }
    }

    fn resource(&self, id: Handle) -> Option<&ProxyResource> {
        self.textures.get(id).or_else(|| self.buffers.get(id))
    }
}

/// State shared between the proxy screen, its contexts and the debug server thread.
pub(crate) struct ScreenShared {
    pub(crate) id: Handle,
    pub(crate) backend: Arc<dyn Screen>,
    pub(crate) trace: TraceWriter,
    next_id: AtomicU64,
    pub(crate) objects: Mutex<ScreenObjects>,
    initial_blocker: BlockFlags,
    events: Mutex<Option<SyncSender<DebugEvent>>>,
    /// Backend context used for debugger texture reads, created on first use.
    private: Mutex<Option<Box<dyn Context>>>,
}

impl ScreenShared {
    pub(crate) fn new(
        backend: Arc<dyn Screen>,
        trace: TraceWriter,
        initial_blocker: BlockFlags,
    ) -> Self {
        Self {
            id: Handle(1),
            backend,
            trace,
            next_id: AtomicU64::new(2),
            objects: Mutex::new(ScreenObjects::new()),
            initial_blocker,
            events: Mutex::new(None),
            private: Mutex::new(None),
        }
    }

    /// Next proxy identity. Identities are unique across every object class of this screen.
    pub(crate) fn alloc_id(&self) -> Handle {
        Handle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Map a proxy buffer or texture to its backend handle. `None` passes through.
    pub(crate) fn unwrap_resource(&self, resource: Option<Handle>) -> Option<Handle> {
        let id = resource?;
        let backend = self.objects.lock().resource(id).map(|r| r.backend);
        if backend.is_none() {
            tracing::debug!(resource = %id, "unknown resource");
        }
        backend
    }

    pub(crate) fn unwrap_surface(&self, surface: Option<Handle>) -> Option<Handle> {
        let id = surface?;
        let backend = self.objects.lock().surfaces.get(id).map(|s| s.backend);
        if backend.is_none() {
            tracing::debug!(surface = %id, "unknown surface");
        }
        backend
    }

    pub(crate) fn sampler_view(&self, view: Option<Handle>) -> Option<ProxySamplerView> {
        let id = view?;
        let proxy = self.objects.lock().sampler_views.get(id).copied();
        if proxy.is_none() {
            tracing::debug!(view = %id, "unknown sampler view");
        }
        proxy
    }

    pub(crate) fn resource(&self, id: Handle) -> Option<ProxyResource> {
        self.objects.lock().resource(id).cloned()
    }

    pub(crate) fn texture(&self, id: Handle) -> Option<ProxyResource> {
        self.objects.lock().textures.get(id).cloned()
    }

    /// Queue an event for the debug client, if a debug server is attached.
    pub(crate) fn notify(&self, event: DebugEvent) {
        let events = self.events.lock();
        let Some(tx) = events.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(?event, "debug event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn attach_events(&self, tx: SyncSender<DebugEvent>) {
        *self.events.lock() = Some(tx);
    }

    pub(crate) fn detach_events(&self) {
        self.events.lock().take();
    }

    /// Run `f` on the private backend context, creating it on first use.
    ///
    /// Returns `None` if the backend cannot create a context.
    pub(crate) fn with_private_context<R>(
        &self,
        f: impl FnOnce(&mut dyn Context) -> R,
    ) -> Option<R> {
        let mut private = self.private.lock();
        if private.is_none() {
            *private = self.backend.create_context();
            if private.is_none() {
                tracing::warn!("backend refused to create the debugger's private context");
            }
        }
        private.as_mut().map(|ctx| f(&mut **ctx))
    }

    fn begin(&self, method: &'static str) -> CallRecord<'_> {
        let mut rec = self.trace.begin_call("pipe_screen", method);
        rec.arg("screen", self.id);
        rec
    }

    fn register_resource(&self, backend: Handle, templ: ResourceTemplate, user: bool) -> Handle {
        let id = self.alloc_id();
        let resource = ProxyResource {
            backend,
            templ,
            user,
        };
        let mut objects = self.objects.lock();
        if resource.is_texture() {
            objects.textures.register(id, resource);
        } else {
            objects.buffers.register(id, resource);
        }
        id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    DebugServer(#[from] DebugServerError),
}

/// A traced screen.
///
/// Implements [`Screen`] by recording each call and forwarding it to the backend. Contexts it
/// creates are [`ProxyContext`]s. Dropping it stops the debug server, records `destroy` and
/// closes the trace document.
pub struct ProxyScreen {
    shared: Arc<ScreenShared>,
    server: Option<DebugServer>,
}

impl ProxyScreen {
    pub fn new(backend: Arc<dyn Screen>, config: &TraceConfig) -> Result<Self, WrapError> {
        let trace = match &config.output {
            Some(path) => TraceWriter::create(path)?,
            None => TraceWriter::discard(),
        };
        let shared = Arc::new(ScreenShared::new(backend, trace, config.initial_blocker));

        let server = match &config.debug_server {
            Some(debug) => Some(DebugServer::start(Arc::clone(&shared), debug.clone())?),
            None => None,
        };

        tracing::info!(
            backend = %shared.backend.name(),
            output = ?config.output,
            debug = ?server.as_ref().map(DebugServer::local_addr),
            "screen wrapped"
        );
        Ok(Self { shared, server })
    }

    pub fn id(&self) -> Handle {
        self.shared.id
    }

    /// Address the debug server is listening on.
    pub fn debug_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(DebugServer::local_addr)
    }

    /// Number of call records written so far.
    pub fn trace_calls(&self) -> u64 {
        self.shared.trace.calls()
    }

    pub fn flush_trace(&self) {
        self.shared.trace.flush();
    }

    pub fn contexts(&self) -> Vec<Handle> {
        self.shared.objects.lock().contexts.list()
    }

    pub fn textures(&self) -> Vec<Handle> {
        self.shared.objects.lock().textures.list()
    }

    pub fn buffers(&self) -> Vec<Handle> {
        self.shared.objects.lock().buffers.list()
    }

    pub fn surfaces(&self) -> Vec<Handle> {
        self.shared.objects.lock().surfaces.list()
    }

    pub fn sampler_views(&self) -> Vec<Handle> {
        self.shared.objects.lock().sampler_views.list()
    }

    /// The backend handle behind a proxy buffer or texture.
    pub fn backend_resource(&self, resource: Handle) -> Option<Handle> {
        self.shared.unwrap_resource(Some(resource))
    }
}

impl Screen for ProxyScreen {
    fn name(&self) -> String {
        let mut rec = self.shared.begin("get_name");
        let name = self.shared.backend.name();
        rec.ret(name.as_str());
        name
    }

    fn vendor(&self) -> String {
        let mut rec = self.shared.begin("get_vendor");
        let vendor = self.shared.backend.vendor();
        rec.ret(vendor.as_str());
        vendor
    }

    fn param(&self, cap: ScreenCap) -> i32 {
        let mut rec = self.shared.begin("get_param");
        rec.arg("param", TraceValue::from_enum(&cap));
        let value = self.shared.backend.param(cap);
        rec.ret(value);
        value
    }

    fn paramf(&self, cap: ScreenCapF) -> f32 {
        let mut rec = self.shared.begin("get_paramf");
        rec.arg("param", TraceValue::from_enum(&cap));
        let value = self.shared.backend.paramf(cap);
        rec.ret(value);
        value
    }

    fn is_format_supported(
        &self,
        format: Format,
        target: TextureTarget,
        sample_count: u32,
        bind: BindFlags,
    ) -> bool {
        let mut rec = self.shared.begin("is_format_supported");
        rec.arg("format", TraceValue::from_enum(&format))
            .arg("target", TraceValue::from_enum(&target))
            .arg("sample_count", sample_count)
            .arg("tex_usage", bind.bits());
        let supported = self
            .shared
            .backend
            .is_format_supported(format, target, sample_count, bind);
        rec.ret(supported);
        supported
    }

    fn create_context(&self) -> Option<Box<dyn Context>> {
        let mut rec = self.shared.begin("context_create");
        let Some(backend) = self.shared.backend.create_context() else {
            rec.ret(TraceValue::null());
            return None;
        };

        let id = self.shared.alloc_id();
        let shared = Arc::new(ContextShared::new(id, backend, self.shared.initial_blocker));
        self.shared
            .objects
            .lock()
            .contexts
            .register(id, Arc::clone(&shared));
        rec.ret(id);
        rec.end();

        tracing::debug!(context = %id, "context created");
        Some(Box::new(ProxyContext::new(Arc::clone(&self.shared), shared)))
    }

    fn resource_create(&self, templ: &ResourceTemplate) -> Option<Handle> {
        let mut rec = self.shared.begin("resource_create");
        rec.arg(
            "templat",
            TraceValue::from_serialize("pipe_resource", templ),
        );
        let backend = self.shared.backend.resource_create(templ);
        rec.ret(backend);
        rec.end();

        let backend = backend?;
        Some(self.shared.register_resource(backend, *templ, false))
    }

    fn user_buffer_create(&self, data: &[u8], bind: BindFlags) -> Option<Handle> {
        let mut rec = self.shared.begin("user_buffer_create");
        rec.arg("data", TraceValue::Bytes(data.to_vec()))
            .arg("size", data.len())
            .arg("usage", bind.bits());
        let backend = self.shared.backend.user_buffer_create(data, bind);
        rec.ret(backend);
        rec.end();

        let backend = backend?;
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Some(
            self.shared
                .register_resource(backend, ResourceTemplate::buffer(size, bind), true),
        )
    }

    fn resource_destroy(&self, resource: Handle) {
        let removed = {
            let mut objects = self.shared.objects.lock();
            objects
                .textures
                .unregister(resource)
                .or_else(|| objects.buffers.unregister(resource))
        };
        let Some(removed) = removed else {
            debug_assert!(false, "destroy of unknown resource {resource}");
            return;
        };

        self.shared
            .begin("resource_destroy")
            .arg("resource", removed.backend);
        self.shared.backend.resource_destroy(removed.backend);
    }

    fn flush_frontbuffer(&self, resource: Handle, level: u32, layer: u32) {
        let Some(backend) = self.shared.unwrap_resource(Some(resource)) else {
            return;
        };
        self.shared
            .begin("flush_frontbuffer")
            .arg("resource", backend)
            .arg("level", level)
            .arg("layer", layer);
        self.shared.backend.flush_frontbuffer(backend, level, layer);
    }

    fn fence_finish(&self, fence: Fence, timeout_ns: u64) -> bool {
        let mut rec = self.shared.begin("fence_finish");
        rec.arg("fence", fence).arg("timeout", timeout_ns);
        let signalled = self.shared.backend.fence_finish(fence, timeout_ns);
        rec.ret(signalled);
        signalled
    }

    fn fence_destroy(&self, fence: Fence) {
        self.shared.begin("fence_destroy").arg("fence", fence);
        self.shared.backend.fence_destroy(fence);
    }
}

impl Drop for ProxyScreen {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop();
        }
        self.shared.detach_events();

        let private = self.shared.private.lock().take();
        drop(private);

        self.shared.begin("destroy");
        self.shared.trace.close();
        let objects = self.shared.objects.lock();
        tracing::info!(
            calls = self.shared.trace.calls(),
            live_textures = objects.textures.count(),
            live_buffers = objects.buffers.count(),
            live_contexts = objects.contexts.count(),
            "screen unwrapped"
        );
    }
}

/// Wrap `backend` according to `config`.
///
/// Fails open: if tracing is disabled or the proxy cannot be set up, the backend itself is
/// returned and rendering continues untraced.
pub fn wrap_screen(backend: Arc<dyn Screen>, config: &TraceConfig) -> Arc<dyn Screen> {
    if !config.enabled {
        return backend;
    }
    match ProxyScreen::new(Arc::clone(&backend), config) {
        Ok(proxy) => Arc::new(proxy),
        Err(err) => {
            tracing::warn!("tracing disabled, screen left unwrapped: {err}");
            backend
        }
    }
}
