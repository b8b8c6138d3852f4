//! Framework lifecycle: a monotonic status machine plus the registry of
//! managed threads it tears down in two priority tiers.
//!
//! Status only ever moves forward. Readers that must observe a stable status
//! across a block of work hold the shared side of an `RwLock` while `start`
//! and `stop` take the exclusive side; the status word itself is an atomic so
//! cheap point reads need no lock at all.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::error::FrameworkError;
use crate::task::{TaskCell, TaskFuture};

/// Lifecycle status, strictly increasing over the manager's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Status {
    WaitingInit = 0,
    Starting = 1,
    Active = 2,
    StoppingLowPriority = 3,
    StoppingHighPriority = 4,
    Stopped = 5,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::WaitingInit,
            1 => Status::Starting,
            2 => Status::Active,
            3 => Status::StoppingLowPriority,
            4 => Status::StoppingHighPriority,
            _ => Status::Stopped,
        }
    }
}

struct ManagedThread {
    name: String,
    handle: JoinHandle<()>,
    /// Wakes the thread out of its blocking wait so it can observe the new
    /// status. The analogue of interrupting the thread.
    interrupt: Box<dyn Fn() + Send>,
    high_priority: bool,
}

/// The part shared with the shutdown thread.
struct LifecycleState {
    status: AtomicU8,
    threads: Mutex<Vec<ManagedThread>>,
}

impl LifecycleState {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn interrupt_tier(&self, high_priority: bool) {
        let threads = self.threads.lock();
        for thread in threads.iter().filter(|t| t.high_priority == high_priority) {
            (thread.interrupt)();
        }
    }

    fn join_tier(&self, high_priority: bool) {
        loop {
            let thread = {
                let mut threads = self.threads.lock();
                match threads.iter().position(|t| t.high_priority == high_priority) {
                    Some(idx) => threads.swap_remove(idx),
                    None => break,
                }
            };
            log::trace!("lifecycle: joining thread {}", thread.name);
            // wake again so a registration that raced the interrupt sweep
            // still observes the shutdown
            (thread.interrupt)();
            if thread.handle.join().is_err() {
                log::warn!("lifecycle: managed thread {} panicked", thread.name);
            }
        }
    }
}

/// Owns the status machine and every thread whose lifetime is bound to it.
pub struct LifecycleManager {
    state: Arc<LifecycleState>,
    transition: RwLock<()>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        LifecycleManager {
            state: Arc::new(LifecycleState {
                status: AtomicU8::new(Status::WaitingInit as u8),
                threads: Mutex::new(Vec::new()),
            }),
            transition: RwLock::new(()),
        }
    }

    pub fn status(&self) -> Status {
        self.state.status()
    }

    /// True once shutdown has begun (or finished).
    pub fn is_stopped(&self) -> bool {
        self.status() > Status::Active
    }

    /// Holds off any `start`/`stop` transition while the guard lives.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.transition.read()
    }

    /// Runs `init` inside the `WaitingInit -> Starting -> Active` transition.
    /// Returns false if the manager already left `WaitingInit`. An error from
    /// `init` leaves the manager in `Starting`; that is an unrecoverable
    /// bootstrap failure and the manager can only be stopped afterwards.
    pub fn start(
        &self,
        init: impl FnOnce() -> Result<(), FrameworkError>,
    ) -> Result<bool, FrameworkError> {
        let _guard = self.transition.write();
        if self.status() != Status::WaitingInit {
            return Ok(false);
        }
        self.state.set_status(Status::Starting);
        log::debug!("lifecycle: starting");
        init()?;
        self.state.set_status(Status::Active);
        log::debug!("lifecycle: active");
        Ok(true)
    }

    /// Begins shutdown and returns a future completing once every managed
    /// thread has been joined and `post_destroy` has run. Only the first
    /// effective call does anything; later calls get a pre-completed future.
    pub fn stop(&self, post_destroy: impl FnOnce() + Send + 'static) -> TaskFuture<()> {
        let _guard = self.transition.write();
        match self.status() {
            Status::WaitingInit => {
                // never started, nothing to unwind
                self.state.set_status(Status::Stopped);
                post_destroy();
                TaskFuture::completed(())
            }
            Status::Starting | Status::Active => {
                self.state.set_status(Status::StoppingLowPriority);
                log::debug!("lifecycle: stopping low-priority threads");
                self.state.interrupt_tier(false);
                let state = self.state.clone();
                let cell = TaskCell::new(move || {
                    state.join_tier(false);
                    state.set_status(Status::StoppingHighPriority);
                    log::debug!("lifecycle: stopping high-priority threads");
                    state.interrupt_tier(true);
                    state.join_tier(true);
                    state.set_status(Status::Stopped);
                    log::debug!("lifecycle: stopped");
                    post_destroy();
                    Ok(())
                });
                let future = TaskFuture::new(cell.clone());
                // the shutdown thread is deliberately unmanaged
                std::thread::Builder::new()
                    .name("lifecycle-shutdown".to_string())
                    .spawn(move || cell.run())
                    .ok();
                future
            }
            _ => TaskFuture::completed(()),
        }
    }

    /// Spawns `body` as a thread owned by this manager. Returns false (and
    /// spawns nothing) unless the status is `Starting` or `Active`.
    ///
    /// `interrupt` must wake the thread out of any blocking wait so it can
    /// re-check the status; it is invoked when the thread's shutdown tier is
    /// reached (and again right before the join). Low-priority threads are
    /// stopped first, high-priority threads keep running through
    /// `StoppingLowPriority` to service the stragglers.
    ///
    /// Deliberately does not take the transition lock: the common caller is
    /// a manager's `initialize` running inside `start`, which already holds
    /// the exclusive side.
    pub fn start_managed_thread(
        &self,
        name: &str,
        high_priority: bool,
        interrupt: impl Fn() + Send + 'static,
        body: impl FnOnce() + Send + 'static,
    ) -> bool {
        let status = self.status();
        if status != Status::Starting && status != Status::Active {
            return false;
        }
        let handle = match std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
        {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("lifecycle: failed to spawn {}: {}", name, err);
                return false;
            }
        };
        self.state.threads.lock().push(ManagedThread {
            name: name.to_string(),
            handle,
            interrupt: Box::new(interrupt),
            high_priority,
        });
        log::trace!(
            "lifecycle: managed thread {} started (high_priority={})",
            name,
            high_priority
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_start_transitions_once() {
        let manager = LifecycleManager::new();
        assert_eq!(manager.status(), Status::WaitingInit);
        assert!(manager.start(|| Ok(())).unwrap());
        assert_eq!(manager.status(), Status::Active);
        assert!(!manager.start(|| Ok(())).unwrap());
    }

    #[test]
    fn test_failed_init_sticks_in_starting() {
        let manager = LifecycleManager::new();
        let result = manager.start(|| {
            Err(FrameworkError::ContextCreation("no device".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(manager.status(), Status::Starting);
    }

    #[test]
    fn test_stop_without_start() {
        let manager = LifecycleManager::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let future = manager.stop(move || flag.store(true, Ordering::SeqCst));
        assert!(future.is_done());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(manager.status(), Status::Stopped);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let manager = LifecycleManager::new();
        manager.start(|| Ok(())).unwrap();
        manager.stop(|| {}).get().unwrap();
        let again = manager.stop(|| {});
        assert!(again.is_done());
        assert_eq!(manager.status(), Status::Stopped);
    }

    #[test]
    fn test_tiered_shutdown_order() {
        let manager = LifecycleManager::new();
        let (tx, rx) = mpsc::channel::<&'static str>();

        manager.start(|| Ok(())).unwrap();

        let (low_wake_tx, low_wake_rx) = mpsc::channel::<()>();
        let tx_low = tx.clone();
        assert!(manager.start_managed_thread(
            "low",
            false,
            move || {
                low_wake_tx.send(()).ok();
            },
            move || {
                low_wake_rx.recv().ok();
                tx_low.send("low").unwrap();
            },
        ));

        let (high_wake_tx, high_wake_rx) = mpsc::channel::<()>();
        assert!(manager.start_managed_thread(
            "high",
            true,
            move || {
                high_wake_tx.send(()).ok();
            },
            move || {
                high_wake_rx.recv().ok();
                tx.send("high").unwrap();
            },
        ));

        manager.stop(|| {}).get().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "low");
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "high");
        assert_eq!(manager.status(), Status::Stopped);
    }

    #[test]
    fn test_no_managed_threads_after_stop_begins() {
        let manager = LifecycleManager::new();
        manager.start(|| Ok(())).unwrap();
        manager.stop(|| {}).get().unwrap();
        assert!(!manager.start_managed_thread("late", false, || {}, || {}));
    }

    #[test]
    fn test_status_ordering() {
        assert!(Status::WaitingInit < Status::Starting);
        assert!(Status::Active < Status::StoppingLowPriority);
        assert!(Status::StoppingHighPriority < Status::Stopped);
    }
}
