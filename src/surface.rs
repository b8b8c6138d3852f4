//! Trait seams between the concurrency core and a native graphics backend.
//!
//! The context manager drives these traits; it never sees a concrete GL
//! type. Identity of contexts and surfaces is `Arc` pointer identity, so a
//! backend does not need to invent ids for the activation protocol to work.

use std::any::Any;
use std::sync::Arc;

use crate::error::FrameworkError;

/// A native context. All methods are called on the context thread only.
pub trait GpuContext: Send + Sync {
    /// Makes this context current on the calling thread.
    fn make_current(&self);

    /// Releases this context from the calling thread.
    fn release(&self);

    /// Destroys the native context. Called exactly once, after a release.
    fn destroy(&self);

    /// Flushes pending native commands.
    fn flush(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A render target the application can activate and draw into.
pub trait Surface: Send + Sync {
    /// The context this surface carries, if it owns one. Offscreen
    /// texture surfaces return `None` and piggy-back on whatever context is
    /// already current.
    fn context(&self) -> Option<Arc<dyn GpuContext>>;

    fn is_destroyed(&self) -> bool;

    /// Invoked on the context thread after `context` became current with
    /// this surface as the pending render target. `layer` selects the image
    /// within a layered target (cube face, 3D slice, array index).
    fn on_surface_activate(&self, context: &Arc<dyn GpuContext>, layer: usize);

    /// Invoked on the context thread when this surface stops being the
    /// active render target.
    fn on_surface_deactivate(&self, context: &Arc<dyn GpuContext>);

    fn as_any(&self) -> &dyn Any;
}

/// Creation parameters for an onscreen surface.
#[derive(Debug, Clone, Default)]
pub struct OnscreenSurfaceOptions {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub undecorated: bool,
}

/// Creation parameters for a render-to-texture surface.
#[derive(Debug, Clone)]
pub struct TextureSurfaceOptions {
    pub width: u32,
    pub height: u32,
    pub layers: usize,
}

impl Default for TextureSurfaceOptions {
    fn default() -> Self {
        TextureSurfaceOptions {
            width: 1,
            height: 1,
            layers: 1,
        }
    }
}

/// Backend entry point: creates contexts and surfaces. The factory outlives
/// every context it creates; `destroy` runs as the framework's final
/// shutdown step.
pub trait SurfaceFactory: Send + Sync {
    /// Creates the hidden context shared by all surfaces, optionally sharing
    /// objects with `share_with`.
    fn create_offscreen_context(
        &self,
        share_with: Option<&Arc<dyn GpuContext>>,
    ) -> Result<Arc<dyn GpuContext>, FrameworkError>;

    fn create_onscreen_surface(
        &self,
        options: &OnscreenSurfaceOptions,
        share_with: &Arc<dyn GpuContext>,
    ) -> Result<Arc<dyn Surface>, FrameworkError>;

    fn create_texture_surface(
        &self,
        options: &TextureSurfaceOptions,
    ) -> Result<Arc<dyn Surface>, FrameworkError>;

    /// Releases anything the factory holds besides contexts and surfaces
    /// (display connections and the like).
    fn destroy(&self);
}
