//! GPU resource lifecycles: typed drivers, per-record lock discipline, and
//! the orphan janitor that disposes native handles whose front-end objects
//! became unreachable.
//!
//! A record outlives both disposal and its front-end object: disposing only
//! clears the native handle, and the record itself is removed once the
//! janitor has scheduled the orphaned handle's disposal on the context
//! thread. Lock-discipline violations (unlocking what was never locked,
//! taking the exclusive lock twice) are caller bugs and panic.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::context::ContextManager;
use crate::error::UpdateError;
use crate::lifecycle::LifecycleManager;

/// How long the janitor sleeps between weak-reference sweeps.
const JANITOR_POLL: Duration = Duration::from_millis(25);

/// Stable identity of a front-end resource object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Whether the manager updates the resource implicitly on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Locking an un-updated resource triggers an update first.
    OnDemand,
    /// Only explicit `update` calls touch the native state.
    Manual,
}

/// Lifecycle status of a resource's native mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    /// No native handle exists (never updated, disposed, or unreachable).
    Disposed,
    /// The last update failed; see the status message.
    Error,
    /// The native mirror matches the described state.
    Ready,
    /// No driver understands this resource type.
    Unsupported,
}

/// Application-facing description of a GPU resource. Implementations hold
/// the *described* state; the native mirror lives behind the manager.
pub trait Resource: Send + Sync + 'static {
    fn id(&self) -> ResourceId;

    fn update_policy(&self) -> UpdatePolicy;

    fn as_any(&self) -> &dyn Any;
}

/// Opaque native-side handle owned by a driver.
pub type HandleRef = Arc<dyn Any + Send + Sync>;

/// Per-type backend logic. All methods except `reset` run on the context
/// thread with a context current.
pub trait ResourceDriver: Send + Sync {
    /// The concrete `Resource` type this driver services.
    fn resource_type(&self) -> TypeId;

    /// Creates the native handle for a resource seen the first time.
    fn init(&self, resource: &dyn Resource) -> HandleRef;

    /// Pushes the described state into the native handle. Returns a status
    /// message for `Ready`, or the failure that becomes `Error`.
    fn update(&self, resource: &dyn Resource, handle: &HandleRef) -> Result<String, UpdateError>;

    /// Releases the native handle.
    fn dispose(&self, handle: &HandleRef);

    /// Clears driver-side change tracking so the next update is full.
    /// Needs no context and may run on any thread.
    fn reset(&self, resource: &dyn Resource, handle: &HandleRef);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Unlocked,
    Shared(u32),
    Exclusive,
}

struct RecordInner {
    handle: Option<HandleRef>,
    status: ResourceStatus,
    message: Option<String>,
    disposable: bool,
    lock: LockState,
}

/// One tracked resource. The front end is held weakly so application code
/// dropping its last `Arc` is observable. The driver rides along so an
/// orphaned handle can still be disposed after the front end is gone.
struct ResourceRecord {
    id: ResourceId,
    front: Weak<dyn Resource>,
    driver: Arc<dyn ResourceDriver>,
    inner: Mutex<RecordInner>,
}

impl ResourceRecord {
    fn new(resource: &Arc<dyn Resource>, driver: Arc<dyn ResourceDriver>) -> Arc<Self> {
        Arc::new(ResourceRecord {
            id: resource.id(),
            front: Arc::downgrade(resource),
            driver,
            inner: Mutex::new(RecordInner {
                handle: None,
                status: ResourceStatus::Disposed,
                message: None,
                disposable: true,
                lock: LockState::Unlocked,
            }),
        })
    }
}

enum JanitorEvent {
    Poke,
}

pub struct ResourceManager {
    lifecycle: OnceLock<Arc<LifecycleManager>>,
    contexts: OnceLock<Arc<ContextManager>>,
    drivers: HashMap<TypeId, Arc<dyn ResourceDriver>>,
    records: Arc<Mutex<HashMap<ResourceId, Arc<ResourceRecord>>>>,
    events: Sender<JanitorEvent>,
    receiver: Mutex<Option<Receiver<JanitorEvent>>>,
}

impl ResourceManager {
    pub fn new(drivers: Vec<Arc<dyn ResourceDriver>>) -> Self {
        let (events, receiver) = std::sync::mpsc::channel();
        ResourceManager {
            lifecycle: OnceLock::new(),
            contexts: OnceLock::new(),
            drivers: drivers
                .into_iter()
                .map(|driver| (driver.resource_type(), driver))
                .collect(),
            records: Arc::new(Mutex::new(HashMap::new())),
            events,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Starts the orphan janitor. Called once while the lifecycle is
    /// `Starting`.
    pub fn initialize(
        self: Arc<Self>,
        lifecycle: Arc<LifecycleManager>,
        contexts: Arc<ContextManager>,
    ) {
        if self.lifecycle.set(lifecycle.clone()).is_err() {
            panic!("resource manager initialized twice");
        }
        if self.contexts.set(contexts).is_err() {
            panic!("resource manager initialized twice");
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .unwrap_or_else(|| panic!("resource manager initialized twice"));
        let manager = self.clone();
        let events = self.events.clone();
        let started = lifecycle.start_managed_thread(
            "resource-janitor",
            false,
            move || {
                events.send(JanitorEvent::Poke).ok();
            },
            move || manager.janitor_loop(receiver),
        );
        if !started {
            panic!("resource janitor could not start");
        }
    }

    fn lifecycle(&self) -> &Arc<LifecycleManager> {
        self.lifecycle
            .get()
            .unwrap_or_else(|| panic!("resource manager used before initialize"))
    }

    fn contexts(&self) -> &Arc<ContextManager> {
        self.contexts
            .get()
            .unwrap_or_else(|| panic!("resource manager used before initialize"))
    }

    fn driver_for(&self, resource: &dyn Resource) -> Option<&Arc<dyn ResourceDriver>> {
        self.drivers.get(&resource.as_any().type_id())
    }

    fn record_for(
        &self,
        resource: &Arc<dyn Resource>,
        driver: &Arc<dyn ResourceDriver>,
    ) -> Arc<ResourceRecord> {
        let mut records = self.records.lock();
        records
            .entry(resource.id())
            .or_insert_with(|| ResourceRecord::new(resource, driver.clone()))
            .clone()
    }

    fn existing_record(&self, resource: &Arc<dyn Resource>) -> Option<Arc<ResourceRecord>> {
        self.records.lock().get(&resource.id()).cloned()
    }

    /// Acquires the shared lock and returns the native handle, implicitly
    /// updating an on-demand resource that is not already locked by anyone.
    /// Returns `None` without locking when the resource is not `Ready`, so
    /// the caller skips the binding (and a later `update` can still take the
    /// exclusive lock). Context-thread-only (it may have to run the driver).
    pub fn lock(&self, resource: &Arc<dyn Resource>) -> Option<HandleRef> {
        assert!(
            self.contexts().is_context_thread(),
            "resource locks are taken on the context thread"
        );
        let driver = match self.driver_for(resource.as_ref()) {
            Some(driver) => driver.clone(),
            None => return None,
        };
        let record = self.record_for(resource, &driver);
        // drivers change-track, so the implicit update is cheap when the
        // native mirror is already in sync
        let needs_update = {
            let inner = record.inner.lock();
            resource.update_policy() == UpdatePolicy::OnDemand
                && inner.lock == LockState::Unlocked
        };
        if needs_update {
            self.update(resource);
        }
        let mut inner = record.inner.lock();
        if inner.status != ResourceStatus::Ready {
            return None;
        }
        inner.lock = match inner.lock {
            LockState::Unlocked => LockState::Shared(1),
            LockState::Shared(n) => LockState::Shared(n + 1),
            LockState::Exclusive => {
                panic!("shared lock requested while exclusively locked")
            }
        };
        inner.handle.clone()
    }

    /// Releases one shared hold.
    ///
    /// # Panics
    ///
    /// Panics when the resource is not shared-locked.
    pub fn unlock(&self, resource: &Arc<dyn Resource>) {
        if self.driver_for(resource.as_ref()).is_none() {
            return;
        }
        let record = match self.existing_record(resource) {
            Some(record) => record,
            None => panic!("unlock of a resource that was never locked"),
        };
        let mut inner = record.inner.lock();
        inner.lock = match inner.lock {
            LockState::Shared(1) => LockState::Unlocked,
            LockState::Shared(n) => LockState::Shared(n - 1),
            _ => panic!("unlock of a resource that is not shared-locked"),
        };
    }

    /// Acquires the exclusive lock.
    ///
    /// # Panics
    ///
    /// Panics when the resource is locked in any way already.
    pub fn lock_exclusively(&self, resource: &Arc<dyn Resource>) {
        let driver = match self.driver_for(resource.as_ref()) {
            Some(driver) => driver.clone(),
            None => return,
        };
        let record = self.record_for(resource, &driver);
        let mut inner = record.inner.lock();
        match inner.lock {
            LockState::Unlocked => inner.lock = LockState::Exclusive,
            LockState::Shared(_) => {
                panic!("exclusive lock requested while shared-locked")
            }
            LockState::Exclusive => {
                panic!("exclusive lock requested while exclusively locked")
            }
        }
    }

    /// Releases the exclusive lock.
    ///
    /// # Panics
    ///
    /// Panics when the resource is not exclusively locked.
    pub fn unlock_exclusively(&self, resource: &Arc<dyn Resource>) {
        if self.driver_for(resource.as_ref()).is_none() {
            return;
        }
        let record = match self.existing_record(resource) {
            Some(record) => record,
            None => panic!("exclusive unlock of a resource that was never locked"),
        };
        let mut inner = record.inner.lock();
        match inner.lock {
            LockState::Exclusive => inner.lock = LockState::Unlocked,
            _ => panic!("exclusive unlock of a resource that is not exclusively locked"),
        }
    }

    /// Pushes the described state to the GPU under the exclusive lock.
    /// Context-thread-only. Returns the resulting status.
    pub fn update(&self, resource: &Arc<dyn Resource>) -> ResourceStatus {
        assert!(
            self.contexts().is_context_thread(),
            "resource updates run on the context thread"
        );
        let driver = match self.driver_for(resource.as_ref()) {
            Some(driver) => driver.clone(),
            None => return ResourceStatus::Unsupported,
        };
        let record = self.record_for(resource, &driver);
        self.lock_exclusively(resource);
        // the exclusive lock is always released, even when the driver fails
        // or panics
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let handle = {
                let mut inner = record.inner.lock();
                match &inner.handle {
                    Some(handle) => handle.clone(),
                    None => {
                        let handle = driver.init(resource.as_ref());
                        inner.handle = Some(handle.clone());
                        handle
                    }
                }
            };
            driver.update(resource.as_ref(), &handle)
        }));
        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                self.unlock_exclusively(resource);
                std::panic::resume_unwind(payload);
            }
        };
        let mut inner = record.inner.lock();
        match result {
            Ok(message) => {
                inner.status = ResourceStatus::Ready;
                inner.message = Some(message);
            }
            Err(UpdateError(message)) => {
                log::warn!("resource {:?}: update failed: {}", record.id, message);
                inner.status = ResourceStatus::Error;
                inner.message = Some(message);
            }
        }
        let status = inner.status;
        drop(inner);
        self.unlock_exclusively(resource);
        status
    }

    /// Releases the native handle under the exclusive lock. The record
    /// survives; a later update recreates the handle. Context-thread-only.
    ///
    /// # Panics
    ///
    /// Panics when the resource is pinned (`disposable == false`), before
    /// any lock is taken, leaving status and handle untouched. Orphan
    /// collection is the only path that bypasses the pin.
    pub fn dispose(&self, resource: &Arc<dyn Resource>) {
        assert!(
            self.contexts().is_context_thread(),
            "resource disposal runs on the context thread"
        );
        let driver = match self.driver_for(resource.as_ref()) {
            Some(driver) => driver.clone(),
            None => return,
        };
        let record = match self.existing_record(resource) {
            Some(record) => record,
            None => return,
        };
        if !record.inner.lock().disposable {
            panic!("dispose requested for a pinned resource");
        }
        self.lock_exclusively(resource);
        {
            let mut inner = record.inner.lock();
            if let Some(handle) = inner.handle.take() {
                driver.dispose(&handle);
            }
            inner.status = ResourceStatus::Disposed;
            inner.message = None;
            log::trace!("resource {:?}: disposed", record.id);
        }
        self.unlock_exclusively(resource);
    }

    /// Clears driver change tracking. Any thread; no lock taken, matching
    /// the driver contract that `reset` touches no native state.
    pub fn reset(&self, resource: &Arc<dyn Resource>) {
        let driver = match self.driver_for(resource.as_ref()) {
            Some(driver) => driver,
            None => return,
        };
        let record = match self.existing_record(resource) {
            Some(record) => record,
            None => return,
        };
        let handle = record.inner.lock().handle.clone();
        if let Some(handle) = handle {
            driver.reset(resource.as_ref(), &handle);
        }
    }

    /// Pins (`false`) or unpins (`true`) the resource against disposal.
    /// A surface whose backing texture must stay alive pins it.
    pub fn set_disposable(&self, resource: &Arc<dyn Resource>, disposable: bool) {
        let driver = match self.driver_for(resource.as_ref()) {
            Some(driver) => driver.clone(),
            None => return,
        };
        let record = self.record_for(resource, &driver);
        record.inner.lock().disposable = disposable;
    }

    /// Current status. Once the framework has stopped this reports
    /// `Disposed` for everything, whatever the records say.
    pub fn status(&self, resource: &Arc<dyn Resource>) -> ResourceStatus {
        if self.lifecycle().is_stopped() {
            return ResourceStatus::Disposed;
        }
        if self.driver_for(resource.as_ref()).is_none() {
            return ResourceStatus::Unsupported;
        }
        match self.existing_record(resource) {
            Some(record) => record.inner.lock().status,
            None => ResourceStatus::Disposed,
        }
    }

    /// Last driver status message. `None` once the framework has stopped.
    pub fn status_message(&self, resource: &Arc<dyn Resource>) -> Option<String> {
        if self.lifecycle().is_stopped() {
            return None;
        }
        match self.existing_record(resource) {
            Some(record) => record.inner.lock().message.clone(),
            None => None,
        }
    }

    fn janitor_loop(&self, receiver: Receiver<JanitorEvent>) {
        log::debug!("resource: janitor running");
        while !self.lifecycle().is_stopped() {
            // poll interval doubles as the orphan-detection latency bound
            match receiver.recv_timeout(JANITOR_POLL) {
                Ok(JanitorEvent::Poke) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
            self.sweep_orphans();
        }
        log::debug!("resource: janitor exited");
    }

    fn sweep_orphans(&self) {
        let orphans: Vec<Arc<ResourceRecord>> = {
            let mut records = self.records.lock();
            let ids: Vec<ResourceId> = records
                .iter()
                .filter(|(_, record)| record.front.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };
        for record in orphans {
            let handle = {
                let mut inner = record.inner.lock();
                // unreachable front ends bypass the disposable pin
                inner.status = ResourceStatus::Disposed;
                inner.message = Some("resource was garbage-collected".to_string());
                inner.handle.take()
            };
            if let Some(handle) = handle {
                let driver = record.driver.clone();
                log::debug!("resource {:?}: disposing orphaned handle", record.id);
                self.contexts().invoke_priority(move || {
                    driver.dispose(&handle);
                    Ok(())
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyResource, DummyResourceDriver, DummySurfaceFactory};
    use std::time::Instant;

    struct Fixture {
        lifecycle: Arc<LifecycleManager>,
        contexts: Arc<ContextManager>,
        resources: Arc<ResourceManager>,
        driver: Arc<DummyResourceDriver>,
    }

    impl Fixture {
        fn start() -> Fixture {
            let lifecycle = Arc::new(LifecycleManager::new());
            let contexts = Arc::new(ContextManager::new());
            let driver = Arc::new(DummyResourceDriver::new());
            let resources = Arc::new(ResourceManager::new(vec![
                driver.clone() as Arc<dyn ResourceDriver>
            ]));
            let init_lifecycle = lifecycle.clone();
            let init_contexts = contexts.clone();
            let init_resources = resources.clone();
            lifecycle
                .start(move || {
                    init_contexts.clone().initialize(
                        init_lifecycle.clone(),
                        Arc::new(DummySurfaceFactory::new()),
                    )?;
                    init_resources.initialize(init_lifecycle, init_contexts);
                    Ok(())
                })
                .unwrap();
            Fixture {
                lifecycle,
                contexts,
                resources,
                driver,
            }
        }

        fn on_worker<T: Send + 'static>(
            &self,
            task: impl FnOnce() -> T + Send + 'static,
        ) -> T {
            self.contexts
                .invoke_on_context_thread(move || Ok(task()), false)
                .get()
                .unwrap()
        }

        fn stop(&self) {
            self.lifecycle.stop(|| {}).get().unwrap();
        }
    }

    fn resource() -> Arc<dyn Resource> {
        Arc::new(DummyResource::new())
    }

    #[test]
    fn test_update_then_status() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let status = fx.on_worker(move || resources.update(&run_res));
        assert_eq!(status, ResourceStatus::Ready);
        assert_eq!(fx.resources.status(&res), ResourceStatus::Ready);
        assert!(fx.resources.status_message(&res).is_some());
        assert_eq!(fx.driver.init_count(), 1);
        assert_eq!(fx.driver.update_count(), 1);
        fx.stop();
        // shutdown special cases
        assert_eq!(fx.resources.status(&res), ResourceStatus::Disposed);
        assert_eq!(fx.resources.status_message(&res), None);
    }

    #[test]
    fn test_unsupported_without_driver() {
        let fx = Fixture::start();

        struct Alien;
        impl Resource for Alien {
            fn id(&self) -> ResourceId {
                ResourceId(u64::MAX)
            }
            fn update_policy(&self) -> UpdatePolicy {
                UpdatePolicy::Manual
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let alien: Arc<dyn Resource> = Arc::new(Alien);
        let resources = fx.resources.clone();
        let run_alien = alien.clone();
        let status = fx.on_worker(move || resources.update(&run_alien));
        assert_eq!(status, ResourceStatus::Unsupported);
        assert_eq!(fx.resources.status(&alien), ResourceStatus::Unsupported);
        fx.stop();
    }

    #[test]
    fn test_failed_update_is_recoverable() {
        let fx = Fixture::start();
        let res = resource();
        fx.driver.fail_next_update("out of memory");
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let status = fx.on_worker(move || resources.update(&run_res));
        assert_eq!(status, ResourceStatus::Error);
        assert_eq!(
            fx.resources.status_message(&res).as_deref(),
            Some("out of memory")
        );
        // exclusive lock was released despite the failure
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let status = fx.on_worker(move || resources.update(&run_res));
        assert_eq!(status, ResourceStatus::Ready);
        fx.stop();
    }

    #[test]
    fn test_on_demand_lock_updates_implicitly() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || {
            let handle = resources.lock(&run_res);
            assert!(handle.is_some());
            resources.unlock(&run_res);
        });
        assert_eq!(fx.driver.update_count(), 1);
        assert_eq!(fx.resources.status(&res), ResourceStatus::Ready);
        fx.stop();
    }

    #[test]
    fn test_lock_returns_no_handle_until_ready() {
        let fx = Fixture::start();
        let res = resource();
        fx.driver.fail_next_update("out of memory");
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || {
            // the implicit update fails, so there is nothing to bind and no
            // shared lock may be left behind
            assert!(resources.lock(&run_res).is_none());
            // a later update can still take the exclusive lock
            assert_eq!(resources.update(&run_res), ResourceStatus::Ready);
            let handle = resources.lock(&run_res);
            assert!(handle.is_some());
            resources.unlock(&run_res);
        });
        assert_eq!(fx.resources.status(&res), ResourceStatus::Ready);
        fx.stop();
    }

    #[test]
    fn test_nested_shared_locks_skip_implicit_update() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || {
            resources.lock(&run_res);
            resources.lock(&run_res);
            resources.unlock(&run_res);
            resources.unlock(&run_res);
        });
        // only the outer lock found the resource unlocked
        assert_eq!(fx.driver.update_count(), 1);
        fx.stop();
    }

    #[test]
    fn test_over_unlock_panics() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let result: Result<(), _> = fx
            .contexts
            .invoke_on_context_thread(
                move || {
                    resources.lock(&run_res);
                    resources.unlock(&run_res);
                    resources.unlock(&run_res);
                    Ok(())
                },
                false,
            )
            .get();
        assert!(result.is_err());
        fx.stop();
    }

    #[test]
    fn test_exclusive_excludes_shared() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let result: Result<(), _> = fx
            .contexts
            .invoke_on_context_thread(
                move || {
                    resources.update(&run_res);
                    resources.lock_exclusively(&run_res);
                    resources.lock(&run_res);
                    Ok(())
                },
                false,
            )
            .get();
        assert!(result.is_err());
        fx.stop();
    }

    #[test]
    fn test_double_exclusive_panics() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let result: Result<(), _> = fx
            .contexts
            .invoke_on_context_thread(
                move || {
                    resources.lock_exclusively(&run_res);
                    resources.lock_exclusively(&run_res);
                    Ok(())
                },
                false,
            )
            .get();
        assert!(result.is_err());
        fx.stop();
    }

    #[test]
    fn test_dispose_and_record_survival() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || {
            resources.update(&run_res);
            resources.dispose(&run_res);
        });
        assert_eq!(fx.resources.status(&res), ResourceStatus::Disposed);
        assert_eq!(fx.resources.status_message(&res), None);
        assert_eq!(fx.driver.dispose_count(), 1);

        // the record survives disposal: update recreates the handle
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let status = fx.on_worker(move || resources.update(&run_res));
        assert_eq!(status, ResourceStatus::Ready);
        assert_eq!(fx.driver.init_count(), 2);
        fx.stop();
    }

    #[test]
    fn test_pinned_dispose_fails_and_leaves_state() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || {
            resources.update(&run_res);
            resources.set_disposable(&run_res, false);
        });

        // disposing a pinned resource always fails and never mutates
        let resources = fx.resources.clone();
        let run_res = res.clone();
        let result: Result<(), _> = fx
            .contexts
            .invoke_on_context_thread(
                move || {
                    resources.dispose(&run_res);
                    Ok(())
                },
                false,
            )
            .get();
        assert!(result.is_err());
        assert_eq!(fx.resources.status(&res), ResourceStatus::Ready);
        assert_eq!(fx.driver.dispose_count(), 0);

        // the failed attempt left no lock behind, and unpinning re-enables
        // disposal
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || {
            resources.set_disposable(&run_res, true);
            resources.dispose(&run_res);
        });
        assert_eq!(fx.resources.status(&res), ResourceStatus::Disposed);
        assert_eq!(fx.driver.dispose_count(), 1);
        fx.stop();
    }

    #[test]
    fn test_reset_needs_no_context() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || resources.update(&run_res));
        // off-thread, no panic
        fx.resources.reset(&res);
        assert_eq!(fx.driver.reset_count(), 1);
        fx.stop();
    }

    #[test]
    fn test_orphaned_handle_is_disposed() {
        let fx = Fixture::start();
        let res = resource();
        let resources = fx.resources.clone();
        let run_res = res.clone();
        fx.on_worker(move || resources.update(&run_res));
        assert_eq!(fx.driver.dispose_count(), 0);

        drop(res);
        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.driver.dispose_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fx.driver.dispose_count(), 1);
        fx.stop();
    }
}
