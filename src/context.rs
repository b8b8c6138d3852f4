//! Context multiplexing onto one dedicated worker thread.
//!
//! Every piece of work that touches a native context runs on a single
//! high-priority managed thread owned by this manager. Application threads
//! submit closures through [`ContextManager::invoke_on_context_thread`] and
//! get a [`TaskFuture`] back; a submission made *from* the worker thread is
//! detected and executed inline so tasks can safely call back into the
//! framework without deadlocking on the bounded queue.

use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::FrameworkError;
use crate::lifecycle::{LifecycleManager, Status};
use crate::surface::{GpuContext, Surface, SurfaceFactory};
use crate::task::{
    TaskCell, TaskFuture, TaskQueue, QUEUE_CAPACITY, QUEUE_OFFER_RETRY, QUEUE_OFFER_TIMEOUT,
};

/// What the worker thread currently has current/active. Touched only by the
/// worker; the mutex exists for the rare off-thread read in diagnostics.
struct ContextSlot {
    current_context: Option<Arc<dyn GpuContext>>,
    active_surface: Option<Arc<dyn Surface>>,
    active_layer: usize,
}

pub struct ContextManager {
    lifecycle: OnceLock<Arc<LifecycleManager>>,
    worker_thread: OnceLock<ThreadId>,
    shared_context: OnceLock<Arc<dyn GpuContext>>,
    queue: Arc<TaskQueue>,
    slot: Mutex<ContextSlot>,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManager {
    pub fn new() -> Self {
        ContextManager {
            lifecycle: OnceLock::new(),
            worker_thread: OnceLock::new(),
            shared_context: OnceLock::new(),
            queue: Arc::new(TaskQueue::new(QUEUE_CAPACITY)),
            slot: Mutex::new(ContextSlot {
                current_context: None,
                active_surface: None,
                active_layer: 0,
            }),
        }
    }

    /// Starts the worker thread and synchronously creates the shared
    /// offscreen context on it. Must be called exactly once, while the
    /// lifecycle is `Starting`.
    ///
    /// # Panics
    ///
    /// Panics when called twice or outside the `Starting` phase.
    pub fn initialize(
        self: Arc<Self>,
        lifecycle: Arc<LifecycleManager>,
        surface_factory: Arc<dyn SurfaceFactory>,
    ) -> Result<(), FrameworkError> {
        assert_eq!(
            lifecycle.status(),
            Status::Starting,
            "context manager must be initialized during framework startup"
        );
        if self.lifecycle.set(lifecycle.clone()).is_err() {
            panic!("context manager initialized twice");
        }

        let manager = self.clone();
        let queue = self.queue.clone();
        let (thread_id_tx, thread_id_rx) = std::sync::mpsc::channel();
        let started = lifecycle.start_managed_thread(
            "context-worker",
            true,
            move || queue.wake_all(),
            move || {
                thread_id_tx.send(std::thread::current().id()).ok();
                manager.worker_loop();
            },
        );
        if !started {
            return Err(FrameworkError::Internal(
                "failed to start context worker thread".to_string(),
            ));
        }
        let thread_id = thread_id_rx
            .recv()
            .map_err(|_| FrameworkError::Internal("context worker died on startup".to_string()))?;
        self.worker_thread
            .set(thread_id)
            .map_err(|_| FrameworkError::Internal("worker thread id set twice".to_string()))?;

        // Bootstrap the shared context on the worker itself. Offered to the
        // queue directly: the caller holds the lifecycle write lock here, so
        // invoke_on_context_thread's read lock would self-deadlock.
        let cell = TaskCell::new(move || surface_factory.create_offscreen_context(None));
        // the queue is empty and the worker is the only consumer
        assert!(
            self.queue.offer(cell.clone(), QUEUE_OFFER_TIMEOUT),
            "bootstrap task rejected by an empty queue"
        );
        let context = TaskFuture::new(cell)
            .get()
            .map_err(|err| match err {
                crate::error::TaskError::Failed(err) => err,
                other => FrameworkError::ContextCreation(other.to_string()),
            })?;
        log::debug!("context: shared context created");
        self.shared_context
            .set(context)
            .map_err(|_| FrameworkError::Internal("shared context set twice".to_string()))?;
        Ok(())
    }

    fn lifecycle(&self) -> &Arc<LifecycleManager> {
        self.lifecycle
            .get()
            .unwrap_or_else(|| panic!("context manager used before initialize"))
    }

    /// True when called from the dedicated worker thread.
    pub fn is_context_thread(&self) -> bool {
        self.worker_thread.get() == Some(&std::thread::current().id())
    }

    /// The shared offscreen context.
    ///
    /// # Panics
    ///
    /// Panics before `initialize` has completed.
    pub fn shared_context(&self) -> &Arc<dyn GpuContext> {
        self.shared_context
            .get()
            .unwrap_or_else(|| panic!("shared context requested before bootstrap"))
    }

    /// Submits `task` to the worker thread.
    ///
    /// Called from the worker itself, the task runs inline and the returned
    /// future is already complete. Otherwise the task is offered to the
    /// bounded queue under the lifecycle read lock; once the framework is
    /// stopping (past `StoppingLowPriority` when `accept_during_shutdown`,
    /// at it otherwise) a pre-cancelled future comes back instead. A queue
    /// that stays full for the whole retry window fails the task with
    /// [`FrameworkError::QueueFull`].
    pub fn invoke_on_context_thread<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> Result<T, FrameworkError> + Send + 'static,
        accept_during_shutdown: bool,
    ) -> TaskFuture<T> {
        if self.is_context_thread() {
            let cell = TaskCell::new(task);
            cell.run();
            return TaskFuture::new(cell);
        }

        let _guard = self.lifecycle().read_lock();
        let status = self.lifecycle().status();
        let rejected = if accept_during_shutdown {
            status > Status::StoppingLowPriority
        } else {
            status > Status::Active
        };
        if rejected {
            log::trace!("context: rejecting task, status {:?}", status);
            return TaskFuture::cancelled();
        }

        let cell = TaskCell::new(task);
        let future = TaskFuture::new(cell.clone());
        let mut offered = false;
        for _ in 0..QUEUE_OFFER_RETRY {
            if self.queue.offer(cell.clone(), QUEUE_OFFER_TIMEOUT) {
                offered = true;
                break;
            }
        }
        if !offered {
            cell.fail(FrameworkError::QueueFull);
        }
        future
    }

    /// Schedules `task` ahead of everything queued, bypassing the capacity
    /// bound. Reserved for the resource janitor's orphan disposal.
    pub(crate) fn invoke_priority<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> Result<T, FrameworkError> + Send + 'static,
    ) -> TaskFuture<T> {
        if self.is_context_thread() {
            let cell = TaskCell::new(task);
            cell.run();
            return TaskFuture::new(cell);
        }
        let _guard = self.lifecycle().read_lock();
        if self.lifecycle().status() > Status::StoppingLowPriority {
            return TaskFuture::cancelled();
        }
        let cell = TaskCell::new(task);
        let future = TaskFuture::new(cell.clone());
        self.queue.push_front(cell);
        future
    }

    /// Makes the shared context current if nothing is. Worker-thread-only.
    ///
    /// # Panics
    ///
    /// Panics off the worker thread.
    pub fn ensure_context(&self) -> Arc<dyn GpuContext> {
        self.assert_context_thread();
        let mut slot = self.slot.lock();
        if let Some(context) = &slot.current_context {
            return context.clone();
        }
        let context = self.shared_context().clone();
        context.make_current();
        log::trace!("context: shared context made current");
        slot.current_context = Some(context.clone());
        context
    }

    /// Activates `surface` at `layer` as the pending render target,
    /// deactivating whatever was active. Worker-thread-only.
    ///
    /// Returns false (leaving no surface active) when the surface was
    /// destroyed. A surface that owns a context makes that context current;
    /// a context-less surface piggy-backs on the current context, making the
    /// shared one current if necessary. Re-activating the already-active
    /// surface still runs a full deactivate/activate cycle so per-layer
    /// setup happens.
    pub fn set_active_surface(&self, surface: &Arc<dyn Surface>, layer: usize) -> bool {
        self.assert_context_thread();
        self.deactivate_surface();
        if surface.is_destroyed() {
            log::trace!("context: refusing to activate destroyed surface");
            return false;
        }

        let mut slot = self.slot.lock();
        match surface.context() {
            Some(surface_context) => {
                let needs_switch = match &slot.current_context {
                    Some(current) => !Arc::ptr_eq(current, &surface_context),
                    None => true,
                };
                if needs_switch {
                    if let Some(current) = slot.current_context.take() {
                        current.release();
                    }
                    surface_context.make_current();
                    slot.current_context = Some(surface_context.clone());
                }
            }
            None => {
                if slot.current_context.is_none() {
                    let shared = self.shared_context().clone();
                    shared.make_current();
                    slot.current_context = Some(shared);
                }
            }
        }
        let context = slot
            .current_context
            .clone()
            .unwrap_or_else(|| panic!("surface activation left no context current"));
        surface.on_surface_activate(&context, layer);
        slot.active_surface = Some(surface.clone());
        slot.active_layer = layer;
        true
    }

    /// Deactivates the active surface, if any. Worker-thread-only.
    pub fn deactivate_surface(&self) {
        self.assert_context_thread();
        let mut slot = self.slot.lock();
        if let Some(surface) = slot.active_surface.take() {
            log::trace!("context: deactivating surface (layer {})", slot.active_layer);
            if let Some(context) = &slot.current_context {
                surface.on_surface_deactivate(context);
            }
            slot.active_layer = 0;
        }
    }

    /// Deactivates `surface` if it is active, then unconditionally releases
    /// the current context. Used before destroying a surface so its native
    /// resources are not current anywhere. Worker-thread-only.
    pub fn force_release(&self, surface: &Arc<dyn Surface>) {
        self.assert_context_thread();
        {
            let slot = self.slot.lock();
            let is_active = slot
                .active_surface
                .as_ref()
                .map(|active| Arc::ptr_eq(active, surface))
                .unwrap_or(false);
            drop(slot);
            if is_active {
                self.deactivate_surface();
            }
        }
        let mut slot = self.slot.lock();
        if let Some(current) = slot.current_context.take() {
            current.release();
            log::trace!("context: context force-released");
        }
    }

    fn assert_context_thread(&self) {
        assert!(
            self.is_context_thread(),
            "must be called on the context thread"
        );
    }

    fn worker_loop(&self) {
        log::debug!("context: worker loop running");
        loop {
            // high-priority thread: keeps servicing tasks through
            // StoppingLowPriority so shutdown work can still run
            if let Some(lifecycle) = self.lifecycle.get() {
                if lifecycle.status() >= Status::StoppingHighPriority {
                    break;
                }
            }
            let task = match self.queue.take() {
                Some(task) => task,
                None => continue,
            };
            task.run();
            // never leave a surface active between tasks
            self.deactivate_surface();
        }

        let mut slot = self.slot.lock();
        if let Some(surface) = slot.active_surface.take() {
            if let Some(context) = &slot.current_context {
                surface.on_surface_deactivate(context);
            }
        }
        if let Some(current) = slot.current_context.take() {
            current.release();
        }
        drop(slot);
        if let Some(shared) = self.shared_context.get() {
            shared.destroy();
            log::debug!("context: shared context destroyed");
        }
        self.queue.drain_cancel();
        log::debug!("context: worker loop exited");
    }
}
