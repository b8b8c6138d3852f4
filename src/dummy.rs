//! Headless backend: contexts, surfaces, resources and a native-call sink
//! that only count what happens to them. This is what the test suite runs
//! against, and a convenient stand-in wherever no real GPU is wanted.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FrameworkError, UpdateError};
use crate::resource::{HandleRef, Resource, ResourceDriver, ResourceId, UpdatePolicy};
use crate::state::{
    BlendFactor, BlendFunction, Color, Comparison, DrawStyles, Material, NativeCalls, Viewport,
};
use crate::surface::{
    GpuContext, OnscreenSurfaceOptions, Surface, SurfaceFactory, TextureSurfaceOptions,
};

#[derive(Default)]
pub struct DummyContext {
    current: AtomicBool,
    destroyed: AtomicBool,
    flushes: AtomicUsize,
}

impl DummyContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl GpuContext for DummyContext {
    fn make_current(&self) {
        self.current.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.current.store(false, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DummySurface {
    context: Option<Arc<DummyContext>>,
    destroyed: AtomicBool,
    activations: AtomicUsize,
    deactivations: AtomicUsize,
    last_layer: AtomicUsize,
}

impl DummySurface {
    pub fn with_context(context: Arc<DummyContext>) -> Self {
        DummySurface {
            context: Some(context),
            destroyed: AtomicBool::new(false),
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
            last_layer: AtomicUsize::new(0),
        }
    }

    pub fn contextless() -> Self {
        DummySurface {
            context: None,
            destroyed: AtomicBool::new(false),
            activations: AtomicUsize::new(0),
            deactivations: AtomicUsize::new(0),
            last_layer: AtomicUsize::new(0),
        }
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub fn last_layer(&self) -> usize {
        self.last_layer.load(Ordering::SeqCst)
    }
}

impl Surface for DummySurface {
    fn context(&self) -> Option<Arc<dyn GpuContext>> {
        self.context
            .as_ref()
            .map(|context| context.clone() as Arc<dyn GpuContext>)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn on_surface_activate(&self, _context: &Arc<dyn GpuContext>, layer: usize) {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.last_layer.store(layer, Ordering::SeqCst);
    }

    fn on_surface_deactivate(&self, _context: &Arc<dyn GpuContext>) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory handing out [`DummyContext`]s and [`DummySurface`]s, with
/// optional scripted failure for bootstrap tests.
pub struct DummySurfaceFactory {
    fail_context_creation: bool,
    contexts_created: AtomicUsize,
    destroyed: AtomicBool,
}

impl Default for DummySurfaceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DummySurfaceFactory {
    pub fn new() -> Self {
        DummySurfaceFactory {
            fail_context_creation: false,
            contexts_created: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    /// A factory whose context creation always fails.
    pub fn failing() -> Self {
        DummySurfaceFactory {
            fail_context_creation: true,
            contexts_created: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl SurfaceFactory for DummySurfaceFactory {
    fn create_offscreen_context(
        &self,
        _share_with: Option<&Arc<dyn GpuContext>>,
    ) -> Result<Arc<dyn GpuContext>, FrameworkError> {
        if self.fail_context_creation {
            return Err(FrameworkError::ContextCreation(
                "scripted failure".to_string(),
            ));
        }
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(DummyContext::new()))
    }

    fn create_onscreen_surface(
        &self,
        _options: &OnscreenSurfaceOptions,
        share_with: &Arc<dyn GpuContext>,
    ) -> Result<Arc<dyn Surface>, FrameworkError> {
        let _ = share_with;
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(DummySurface::with_context(Arc::new(
            DummyContext::new(),
        ))))
    }

    fn create_texture_surface(
        &self,
        _options: &TextureSurfaceOptions,
    ) -> Result<Arc<dyn Surface>, FrameworkError> {
        Ok(Arc::new(DummySurface::contextless()))
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// A resource with no described state beyond its identity.
pub struct DummyResource {
    id: ResourceId,
    policy: UpdatePolicy,
}

impl Default for DummyResource {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyResource {
    pub fn new() -> Self {
        DummyResource {
            id: ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::SeqCst)),
            policy: UpdatePolicy::OnDemand,
        }
    }

    pub fn manual() -> Self {
        DummyResource {
            id: ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::SeqCst)),
            policy: UpdatePolicy::Manual,
        }
    }
}

impl Resource for DummyResource {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn update_policy(&self) -> UpdatePolicy {
        self.policy
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct DummyHandle;

/// Driver for [`DummyResource`] that counts every call and can be told to
/// fail its next update.
pub struct DummyResourceDriver {
    inits: AtomicUsize,
    updates: AtomicUsize,
    disposes: AtomicUsize,
    resets: AtomicUsize,
    fail_next: Mutex<Option<String>>,
}

impl Default for DummyResourceDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyResourceDriver {
    pub fn new() -> Self {
        DummyResourceDriver {
            inits: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            disposes: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
        }
    }

    pub fn fail_next_update(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn dispose_count(&self) -> usize {
        self.disposes.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl ResourceDriver for DummyResourceDriver {
    fn resource_type(&self) -> TypeId {
        TypeId::of::<DummyResource>()
    }

    fn init(&self, _resource: &dyn Resource) -> HandleRef {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Arc::new(DummyHandle)
    }

    fn update(&self, _resource: &dyn Resource, _handle: &HandleRef) -> Result<String, UpdateError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        match self.fail_next.lock().take() {
            Some(message) => Err(UpdateError(message)),
            None => Ok("ok".to_string()),
        }
    }

    fn dispose(&self, _handle: &HandleRef) {
        self.disposes.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self, _resource: &dyn Resource, _handle: &HandleRef) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// [`NativeCalls`] sink that records invocation counts and last arguments.
#[derive(Default)]
pub struct CountingCalls {
    counts: HashMap<&'static str, usize>,
    last_array_buffer: Option<ResourceId>,
}

impl CountingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, call: &str) -> usize {
        self.counts.get(call).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn last_array_buffer(&self) -> Option<ResourceId> {
        self.last_array_buffer
    }

    fn bump(&mut self, call: &'static str) {
        *self.counts.entry(call).or_insert(0) += 1;
    }
}

impl NativeCalls for CountingCalls {
    fn set_blend_enabled(&mut self, _enabled: bool) {
        self.bump("set_blend_enabled");
    }

    fn set_blend_color(&mut self, _color: Color) {
        self.bump("set_blend_color");
    }

    fn set_blend_mode(&mut self, _function: BlendFunction, _src: BlendFactor, _dst: BlendFactor) {
        self.bump("set_blend_mode");
    }

    fn set_color_mask(&mut self, _mask: [bool; 4]) {
        self.bump("set_color_mask");
    }

    fn set_depth_test(&mut self, _test: Comparison) {
        self.bump("set_depth_test");
    }

    fn set_depth_write(&mut self, _write: bool) {
        self.bump("set_depth_write");
    }

    fn set_depth_offsets(&mut self, _factor: f32, _units: f32) {
        self.bump("set_depth_offsets");
    }

    fn set_draw_styles(&mut self, _styles: DrawStyles) {
        self.bump("set_draw_styles");
    }

    fn set_viewport(&mut self, _viewport: Viewport) {
        self.bump("set_viewport");
    }

    fn bind_texture(&mut self, _unit: u32, _texture: Option<ResourceId>) {
        self.bump("bind_texture");
    }

    fn bind_array_buffer(&mut self, buffer: Option<ResourceId>) {
        self.bump("bind_array_buffer");
        self.last_array_buffer = buffer;
    }

    fn set_attribute_pointer(&mut self, _slot: u32, _buffer: ResourceId) {
        self.bump("set_attribute_pointer");
    }

    fn disable_attribute(&mut self, _slot: u32) {
        self.bump("disable_attribute");
    }

    fn bind_shader(&mut self, _shader: Option<ResourceId>) {
        self.bump("bind_shader");
    }

    fn set_material(&mut self, _material: Material) {
        self.bump("set_material");
    }

    fn set_global_ambient(&mut self, _color: Color) {
        self.bump("set_global_ambient");
    }
}
