//! Threaded hardware-abstraction core for OpenGL-style renderers.
//!
//! Everything that touches a native graphics context runs on one dedicated
//! worker thread; application threads talk to it through queued tasks and
//! futures. On top of that sit GPU-resource lifecycle tracking (with
//! reachability-driven cleanup of orphaned native handles) and a
//! redundant-state-elimination layer for replaying logical render state.
//!
//! The usual entry point is [`Framework::new`] with a backend's
//! [`SurfaceFactory`] and its [`ResourceDriver`]s; the [`dummy`] module has
//! a headless backend for tests and tooling.

pub mod context;
pub mod destructible;
pub mod dummy;
pub mod error;
pub mod framework;
pub mod lifecycle;
pub mod resource;
pub mod state;
pub mod surface;
pub mod task;

pub use context::ContextManager;
pub use destructible::{Destructible, DestructibleManager, ReachabilityGuard};
pub use error::{FrameworkError, TaskError, UpdateError};
pub use framework::{Framework, HardwareAccess};
pub use lifecycle::{LifecycleManager, Status};
pub use resource::{
    HandleRef, Resource, ResourceDriver, ResourceId, ResourceManager, ResourceStatus,
    UpdatePolicy,
};
pub use state::{NativeCalls, RenderState, StateTracker};
pub use surface::{
    GpuContext, OnscreenSurfaceOptions, Surface, SurfaceFactory, TextureSurfaceOptions,
};
pub use task::TaskFuture;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-time process setup for binaries embedding the crate. Library users
/// that configure logging themselves can skip it.
pub fn init() {
    log::info!("vermilion-hal {}", VERSION);
}
