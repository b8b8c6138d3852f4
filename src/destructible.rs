//! Reachability-triggered destruction of paired public/internal objects.
//!
//! A public-facing object embeds the [`ReachabilityGuard`] returned by
//! [`DestructibleManager::manage`]; when the public object is dropped the
//! guard notifies the janitor thread, which destroys the internal target the
//! application can no longer reach. On shutdown every still-managed target
//! is destroyed synchronously, so native resources never outlive the
//! framework regardless of drop timing.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::lifecycle::LifecycleManager;
use crate::task::TaskFuture;

/// An internal object with a heavyweight destruction step that must run even
/// if the application just drops its handles.
pub trait Destructible: Send + Sync {
    /// Begins destruction, idempotently. The future completes once the
    /// native cleanup has run.
    fn destroy(&self) -> TaskFuture<()>;

    fn is_destroyed(&self) -> bool;
}

enum JanitorEvent {
    Unreachable(u64),
    Poke,
}

struct Managed {
    id: u64,
    target: Arc<dyn Destructible>,
}

/// Dropping the guard reports the owning public object as unreachable.
pub struct ReachabilityGuard {
    id: u64,
    events: Sender<JanitorEvent>,
}

impl Drop for ReachabilityGuard {
    fn drop(&mut self) {
        // janitor gone means shutdown already destroyed everything
        self.events.send(JanitorEvent::Unreachable(self.id)).ok();
    }
}

pub struct DestructibleManager {
    lifecycle: OnceLock<Arc<LifecycleManager>>,
    managed: Arc<Mutex<Vec<Managed>>>,
    events: Sender<JanitorEvent>,
    receiver: Mutex<Option<Receiver<JanitorEvent>>>,
    next_id: Mutex<u64>,
}

impl Default for DestructibleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DestructibleManager {
    pub fn new() -> Self {
        let (events, receiver) = std::sync::mpsc::channel();
        DestructibleManager {
            lifecycle: OnceLock::new(),
            managed: Arc::new(Mutex::new(Vec::new())),
            events,
            receiver: Mutex::new(Some(receiver)),
            next_id: Mutex::new(0),
        }
    }

    /// Starts the janitor thread. Called once while the lifecycle is
    /// `Starting`.
    pub fn initialize(&self, lifecycle: Arc<LifecycleManager>) {
        if self.lifecycle.set(lifecycle.clone()).is_err() {
            panic!("destructible manager initialized twice");
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .unwrap_or_else(|| panic!("destructible manager initialized twice"));
        let managed = self.managed.clone();
        let events = self.events.clone();
        let janitor_lifecycle = lifecycle.clone();
        let started = lifecycle.start_managed_thread(
            "destructible-janitor",
            false,
            move || {
                events.send(JanitorEvent::Poke).ok();
            },
            move || janitor_loop(janitor_lifecycle, managed, receiver),
        );
        if !started {
            panic!("destructible janitor could not start");
        }
    }

    /// Registers `target` for destroy-on-unreachable. The returned guard
    /// must be stored inside the public-facing object whose reachability
    /// gates the target's life. No-op guard when the framework is already
    /// stopping; the shutdown drain covers the target's destruction then.
    pub fn manage(&self, target: Arc<dyn Destructible>) -> ReachabilityGuard {
        let lifecycle = self
            .lifecycle
            .get()
            .unwrap_or_else(|| panic!("destructible manager used before initialize"));
        let _guard = lifecycle.read_lock();
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        if !lifecycle.is_stopped() {
            self.managed.lock().push(Managed {
                id,
                target,
            });
        }
        ReachabilityGuard {
            id,
            events: self.events.clone(),
        }
    }
}

fn janitor_loop(
    lifecycle: Arc<LifecycleManager>,
    managed: Arc<Mutex<Vec<Managed>>>,
    receiver: Receiver<JanitorEvent>,
) {
    log::debug!("destructible: janitor running");
    while !lifecycle.is_stopped() {
        match receiver.recv() {
            Ok(JanitorEvent::Unreachable(id)) => {
                let target = {
                    let mut managed = managed.lock();
                    managed
                        .iter()
                        .position(|m| m.id == id)
                        .map(|idx| managed.swap_remove(idx).target)
                };
                if let Some(target) = target {
                    log::debug!("destructible: destroying unreachable target");
                    // async destroy; shutdown drain picks it up if needed
                    target.destroy();
                }
            }
            Ok(JanitorEvent::Poke) => {}
            Err(_) => break,
        }
    }

    // shutdown drain: destroy everything left, synchronously
    let leftovers: Vec<Managed> = std::mem::take(&mut *managed.lock());
    for managed in leftovers {
        log::debug!("destructible: shutdown-destroying managed target");
        managed.target.destroy().wait();
    }
    log::debug!("destructible: janitor exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    struct Flagged {
        destroyed: AtomicBool,
    }

    impl Flagged {
        fn new() -> Arc<Self> {
            Arc::new(Flagged {
                destroyed: AtomicBool::new(false),
            })
        }
    }

    impl Destructible for Flagged {
        fn destroy(&self) -> TaskFuture<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            TaskFuture::completed(())
        }

        fn is_destroyed(&self) -> bool {
            self.destroyed.load(Ordering::SeqCst)
        }
    }

    fn start() -> (Arc<LifecycleManager>, Arc<DestructibleManager>) {
        let lifecycle = Arc::new(LifecycleManager::new());
        let manager = Arc::new(DestructibleManager::new());
        let init_manager = manager.clone();
        let init_lifecycle = lifecycle.clone();
        lifecycle
            .start(move || {
                init_manager.initialize(init_lifecycle);
                Ok(())
            })
            .unwrap();
        (lifecycle, manager)
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
    fn test_drop_triggers_destroy() {
        let (lifecycle, manager) = start();
        let target = Flagged::new();
        let guard = manager.manage(target.clone());
        assert!(!target.is_destroyed());
        drop(guard);
        assert!(wait_until(|| target.is_destroyed()));
        lifecycle.stop(|| {}).get().unwrap();
    }

    #[test]
    fn test_shutdown_destroys_leftovers() {
        let (lifecycle, manager) = start();
        let target = Flagged::new();
        let _guard = manager.manage(target.clone());
        lifecycle.stop(|| {}).get().unwrap();
        assert!(target.is_destroyed());
    }

    #[test]
    fn test_manage_after_stop_is_inert() {
        let (lifecycle, manager) = start();
        lifecycle.stop(|| {}).get().unwrap();
        let target = Flagged::new();
        let guard = manager.manage(target.clone());
        drop(guard);
        // never registered, nothing destroys it
        std::thread::sleep(Duration::from_millis(20));
        assert!(!target.is_destroyed());
    }
}
