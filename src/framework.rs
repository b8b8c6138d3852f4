//! The public framework surface tying the managers together.
//!
//! A [`Framework`] is a cheaply cloneable handle; the heavyweight state
//! lives in an inner object registered with the destructible manager, so
//! dropping the last handle destroys the framework even without an explicit
//! [`Framework::destroy`] call.

use std::sync::Arc;

use static_assertions::assert_impl_all;

use crate::context::ContextManager;
use crate::destructible::{Destructible, DestructibleManager, ReachabilityGuard};
use crate::error::{FrameworkError, TaskError};
use crate::lifecycle::LifecycleManager;
use crate::resource::{HandleRef, Resource, ResourceDriver, ResourceManager, ResourceStatus};
use crate::surface::{
    OnscreenSurfaceOptions, Surface, SurfaceFactory, TextureSurfaceOptions,
};
use crate::task::TaskFuture;

/// Hardware entry points handed to a queued task. Only valid on the context
/// thread, for the duration of the task.
pub struct HardwareAccess {
    contexts: Arc<ContextManager>,
    resources: Arc<ResourceManager>,
}

impl HardwareAccess {
    /// Makes sure some context is current and returns it.
    pub fn ensure_context(&self) -> Arc<dyn crate::surface::GpuContext> {
        self.contexts.ensure_context()
    }

    /// Activates `surface` as the render target. False if it was destroyed.
    pub fn set_active_surface(&self, surface: &Arc<dyn Surface>, layer: usize) -> bool {
        self.contexts.set_active_surface(surface, layer)
    }

    /// Deactivates `surface` if active and releases the current context.
    pub fn force_release(&self, surface: &Arc<dyn Surface>) {
        self.contexts.force_release(surface)
    }

    /// Shared-locks `resource` and returns its native handle, or `None`
    /// when the resource is not ready and there is nothing to bind.
    pub fn lock(&self, resource: &Arc<dyn Resource>) -> Option<HandleRef> {
        self.resources.lock(resource)
    }

    pub fn unlock(&self, resource: &Arc<dyn Resource>) {
        self.resources.unlock(resource)
    }

    pub fn lock_exclusively(&self, resource: &Arc<dyn Resource>) {
        self.resources.lock_exclusively(resource)
    }

    pub fn unlock_exclusively(&self, resource: &Arc<dyn Resource>) {
        self.resources.unlock_exclusively(resource)
    }

    pub fn update(&self, resource: &Arc<dyn Resource>) -> ResourceStatus {
        self.resources.update(resource)
    }

    pub fn dispose(&self, resource: &Arc<dyn Resource>) {
        self.resources.dispose(resource)
    }

    pub fn reset(&self, resource: &Arc<dyn Resource>) {
        self.resources.reset(resource)
    }

    pub fn set_disposable(&self, resource: &Arc<dyn Resource>, disposable: bool) {
        self.resources.set_disposable(resource, disposable)
    }

    pub fn status(&self, resource: &Arc<dyn Resource>) -> ResourceStatus {
        self.resources.status(resource)
    }
}

struct FrameworkInner {
    lifecycle: Arc<LifecycleManager>,
    contexts: Arc<ContextManager>,
    resources: Arc<ResourceManager>,
    destructibles: Arc<DestructibleManager>,
    surface_factory: Arc<dyn SurfaceFactory>,
}

impl Destructible for FrameworkInner {
    fn destroy(&self) -> TaskFuture<()> {
        let factory = self.surface_factory.clone();
        self.lifecycle.stop(move || factory.destroy())
    }

    fn is_destroyed(&self) -> bool {
        self.lifecycle.is_stopped()
    }
}

/// Entry point to the whole subsystem.
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
    // last handle dropped -> destructible janitor destroys the framework
    _reachability: Arc<ReachabilityGuard>,
}

assert_impl_all!(Framework: Send, Sync);

impl Framework {
    /// Boots the framework: starts the context worker, creates the shared
    /// native context, and starts the janitors. A context-creation failure
    /// is fatal and comes back as an error.
    pub fn new(
        surface_factory: Arc<dyn SurfaceFactory>,
        drivers: Vec<Arc<dyn ResourceDriver>>,
    ) -> Result<Framework, FrameworkError> {
        let lifecycle = Arc::new(LifecycleManager::new());
        let contexts = Arc::new(ContextManager::new());
        let resources = Arc::new(ResourceManager::new(drivers));
        let destructibles = Arc::new(DestructibleManager::new());

        let init_lifecycle = lifecycle.clone();
        let init_contexts = contexts.clone();
        let init_resources = resources.clone();
        let init_destructibles = destructibles.clone();
        let init_factory = surface_factory.clone();
        let started = lifecycle.start(move || {
            init_contexts
                .clone()
                .initialize(init_lifecycle.clone(), init_factory)?;
            init_resources.initialize(init_lifecycle.clone(), init_contexts);
            init_destructibles.initialize(init_lifecycle);
            Ok(())
        });
        if let Err(err) = started {
            // unwind the half-started managers before reporting
            lifecycle.stop(|| {}).wait();
            return Err(err);
        }

        let inner = Arc::new(FrameworkInner {
            lifecycle,
            contexts,
            resources,
            destructibles: destructibles.clone(),
            surface_factory,
        });
        let reachability = destructibles.manage(inner.clone());
        log::debug!("framework: started");
        Ok(Framework {
            inner,
            _reachability: Arc::new(reachability),
        })
    }

    /// Queues `task` for the context thread and returns its future. `group`
    /// names the ordering domain for diagnostics; all groups currently share
    /// the single context-thread queue, which is FIFO per producer.
    pub fn queue<T, F>(&self, group: &str, task: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&HardwareAccess) -> Result<T, FrameworkError> + Send + 'static,
    {
        log::trace!("framework: queueing task in group {}", group);
        let access = HardwareAccess {
            contexts: self.inner.contexts.clone(),
            resources: self.inner.resources.clone(),
        };
        self.inner
            .contexts
            .invoke_on_context_thread(move || task(&access), false)
    }

    /// Updates `resource` synchronously. `Disposed` when the framework was
    /// destroyed before the update could run.
    pub fn update(&self, resource: Arc<dyn Resource>) -> ResourceStatus {
        let future = self.queue("resource", move |hw| Ok(hw.update(&resource)));
        match future.get() {
            Ok(status) => status,
            Err(TaskError::Cancelled) => ResourceStatus::Disposed,
            Err(err) => {
                log::warn!("framework: synchronous update failed: {}", err);
                ResourceStatus::Error
            }
        }
    }

    /// Disposes `resource` synchronously. A no-op once destroyed.
    pub fn dispose(&self, resource: Arc<dyn Resource>) {
        let future = self.queue("resource", move |hw| {
            hw.dispose(&resource);
            Ok(())
        });
        match future.get() {
            Ok(()) | Err(TaskError::Cancelled) => {}
            Err(err) => log::warn!("framework: synchronous dispose failed: {}", err),
        }
    }

    /// Clears driver change tracking for `resource`. Runs inline; needs no
    /// context.
    pub fn reset(&self, resource: &Arc<dyn Resource>) {
        self.inner.resources.reset(resource)
    }

    /// Current status of `resource`'s native mirror. Queried directly, not
    /// queued: the status word is just a read under the record monitor.
    pub fn status(&self, resource: &Arc<dyn Resource>) -> ResourceStatus {
        self.inner.resources.status(resource)
    }

    pub fn status_message(&self, resource: &Arc<dyn Resource>) -> Option<String> {
        self.inner.resources.status_message(resource)
    }

    /// Queues a flush of `surface`'s pending rendering. The future completes
    /// once the native flush ran.
    pub fn flush(&self, surface: Arc<dyn Surface>, group: &str) -> TaskFuture<()> {
        self.queue(group, move |hw| {
            if hw.set_active_surface(&surface, 0) {
                hw.ensure_context().flush();
            }
            Ok(())
        })
    }

    /// An ordering barrier: the returned future completes only after every
    /// task queued to `group` before it has run.
    pub fn sync(&self, group: &str) -> TaskFuture<()> {
        self.queue(group, |_| Ok(()))
    }

    pub fn create_onscreen_surface(
        &self,
        options: &OnscreenSurfaceOptions,
    ) -> Result<Arc<dyn Surface>, FrameworkError> {
        let factory = self.inner.surface_factory.clone();
        let options = options.clone();
        let shared = self.inner.contexts.shared_context().clone();
        self.inner
            .contexts
            .invoke_on_context_thread(
                move || factory.create_onscreen_surface(&options, &shared),
                false,
            )
            .get()
            .map_err(|err| match err {
                TaskError::Failed(err) => err,
                _ => FrameworkError::ShuttingDown,
            })
    }

    pub fn create_texture_surface(
        &self,
        options: &TextureSurfaceOptions,
    ) -> Result<Arc<dyn Surface>, FrameworkError> {
        let factory = self.inner.surface_factory.clone();
        let options = options.clone();
        self.inner
            .contexts
            .invoke_on_context_thread(move || factory.create_texture_surface(&options), false)
            .get()
            .map_err(|err| match err {
                TaskError::Failed(err) => err,
                _ => FrameworkError::ShuttingDown,
            })
    }

    /// Registers `target` for destroy-on-unreachable alongside the
    /// framework's own resources.
    pub fn manage_destructible(&self, target: Arc<dyn Destructible>) -> ReachabilityGuard {
        self.inner.destructibles.manage(target)
    }

    /// Begins an orderly shutdown. Idempotent; the future completes once
    /// every managed thread has stopped and the surface factory was torn
    /// down.
    pub fn destroy(&self) -> TaskFuture<()> {
        self.inner.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyResource, DummyResourceDriver, DummySurfaceFactory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct Fixture {
        framework: Framework,
        factory: Arc<DummySurfaceFactory>,
        driver: Arc<DummyResourceDriver>,
    }

    impl Fixture {
        fn start() -> Fixture {
            let _ = env_logger::builder().is_test(true).try_init();
            let factory = Arc::new(DummySurfaceFactory::new());
            let driver = Arc::new(DummyResourceDriver::new());
            let framework = Framework::new(
                factory.clone(),
                vec![driver.clone() as Arc<dyn ResourceDriver>],
            )
            .unwrap();
            Fixture {
                framework,
                factory,
                driver,
            }
        }
    }

    fn wait_until(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_bootstrap_failure_surfaces() {
        let factory = Arc::new(DummySurfaceFactory::failing());
        let result = Framework::new(factory, Vec::new());
        match result {
            Err(FrameworkError::ContextCreation(_)) => {}
            _ => panic!("expected a context creation failure"),
        }
    }

    #[test]
    fn test_queue_and_sync() {
        let fx = Fixture::start();
        let value = fx
            .framework
            .queue("test", |hw| {
                hw.ensure_context();
                Ok(11)
            })
            .get()
            .unwrap();
        assert_eq!(value, 11);
        fx.framework.sync("test").get().unwrap();
        fx.framework.destroy().get().unwrap();
    }

    #[test]
    fn test_synchronous_resource_wrappers() {
        let fx = Fixture::start();
        let resource: Arc<dyn Resource> = Arc::new(DummyResource::new());
        assert_eq!(
            fx.framework.update(resource.clone()),
            ResourceStatus::Ready
        );
        assert_eq!(fx.framework.status(&resource), ResourceStatus::Ready);
        assert_eq!(
            fx.framework.status_message(&resource).as_deref(),
            Some("ok")
        );
        fx.framework.dispose(resource.clone());
        assert_eq!(fx.framework.status(&resource), ResourceStatus::Disposed);
        assert_eq!(fx.driver.dispose_count(), 1);
        fx.framework.destroy().get().unwrap();
        // after destruction the wrappers degrade instead of failing
        assert_eq!(
            fx.framework.update(resource.clone()),
            ResourceStatus::Disposed
        );
        fx.framework.dispose(resource);
    }

    #[test]
    fn test_flush_reaches_native_context() {
        let fx = Fixture::start();
        let surface = fx
            .framework
            .create_texture_surface(&TextureSurfaceOptions::default())
            .unwrap();
        fx.framework.flush(surface, "render").get().unwrap();
        fx.framework.destroy().get().unwrap();
    }

    #[test]
    fn test_destroy_is_idempotent_and_tears_down_factory() {
        let fx = Fixture::start();
        assert!(!fx.framework.is_destroyed());
        fx.framework.destroy().get().unwrap();
        assert!(fx.framework.is_destroyed());
        assert!(fx.factory.is_destroyed());
        // again, immediately complete
        let again = fx.framework.destroy();
        assert!(again.is_done());
    }

    #[test]
    fn test_dropping_last_handle_destroys() {
        let factory = Arc::new(DummySurfaceFactory::new());
        let framework = Framework::new(factory.clone(), Vec::new()).unwrap();
        let second = framework.clone();
        drop(framework);
        assert!(!second.is_destroyed());
        drop(second);
        assert!(wait_until(|| factory.is_destroyed()));
    }

    #[test]
    fn test_ten_threads_hundred_tasks_then_destroy() {
        let fx = Fixture::start();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let framework = fx.framework.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let counter = counter.clone();
                    framework
                        .queue("stress", move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .get()
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        fx.framework.destroy().get().unwrap();
        let rejected = fx.framework.queue("stress", |_| Ok(()));
        assert!(rejected.is_cancelled());
    }
}
