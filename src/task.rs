//! Waitable task cells and the bounded deque feeding the context thread.
//!
//! `TaskCell` pairs a deferred closure with a single-assignment result slot
//! that callers can block on through a [`TaskFuture`]. The cell runs at most
//! once; cancellation only succeeds before the closure starts. Panics inside
//! the closure are captured so the worker loop survives misbehaving tasks.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{FrameworkError, TaskError};

/// Maximum number of queued tasks before producers start blocking.
pub const QUEUE_CAPACITY: usize = 10;

/// How long a single `offer` attempt blocks before re-checking.
pub const QUEUE_OFFER_TIMEOUT: Duration = Duration::from_millis(5);

/// How many offer attempts a producer makes before giving up.
pub const QUEUE_OFFER_RETRY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

struct CellInner<T> {
    state: TaskState,
    work: Option<Box<dyn FnOnce() -> Result<T, FrameworkError> + Send>>,
    result: Option<Result<T, FrameworkError>>,
}

/// Single-assignment result cell shared between the producer-facing
/// [`TaskFuture`] and the worker that eventually runs the closure.
pub struct TaskCell<T> {
    inner: Mutex<CellInner<T>>,
    done: Condvar,
}

impl<T: Send + 'static> TaskCell<T> {
    pub fn new(
        work: impl FnOnce() -> Result<T, FrameworkError> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(TaskCell {
            inner: Mutex::new(CellInner {
                state: TaskState::Pending,
                work: Some(Box::new(work)),
                result: None,
            }),
            done: Condvar::new(),
        })
    }

    /// Runs the deferred closure exactly once. Later calls are no-ops, as are
    /// calls after cancellation.
    pub fn run(&self) {
        let work = {
            let mut inner = self.inner.lock();
            if inner.state != TaskState::Pending {
                return;
            }
            inner.state = TaskState::Running;
            inner.work.take()
        };
        let work = match work {
            Some(work) => work,
            None => return,
        };
        let result = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(result) => result,
            Err(payload) => Err(FrameworkError::TaskPanicked(panic_message(&*payload))),
        };
        let mut inner = self.inner.lock();
        inner.state = TaskState::Completed;
        inner.result = Some(result);
        self.done.notify_all();
    }

    /// Marks the cell failed without running it. Used when submission itself
    /// fails after the future has already been handed out.
    pub fn fail(&self, err: FrameworkError) {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Pending {
            inner.state = TaskState::Completed;
            inner.work = None;
            inner.result = Some(Err(err));
            self.done.notify_all();
        }
    }

    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Pending {
            inner.state = TaskState::Cancelled;
            inner.work = None;
            self.done.notify_all();
            true
        } else {
            false
        }
    }

    fn wait_locked(&self, deadline: Option<Instant>) -> Result<(), TaskError> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                TaskState::Completed => return Ok(()),
                TaskState::Cancelled => return Err(TaskError::Cancelled),
                _ => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut inner, deadline).timed_out() {
                        if inner.state == TaskState::Completed {
                            return Ok(());
                        }
                        if inner.state == TaskState::Cancelled {
                            return Err(TaskError::Cancelled);
                        }
                        return Err(TaskError::Timeout);
                    }
                }
                None => self.done.wait(&mut inner),
            }
        }
    }

    fn take_result(&self) -> Result<T, TaskError> {
        let mut inner = self.inner.lock();
        match inner.result.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(TaskError::Failed(err)),
            None => Err(TaskError::Cancelled),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Caller-facing handle on a queued task's eventual result.
pub struct TaskFuture<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T: Send + 'static> TaskFuture<T> {
    pub(crate) fn new(cell: Arc<TaskCell<T>>) -> Self {
        TaskFuture { cell }
    }

    /// A future that already holds `value`. Returned by reentrant submission.
    pub fn completed(value: T) -> Self {
        TaskFuture {
            cell: Arc::new(TaskCell {
                inner: Mutex::new(CellInner {
                    state: TaskState::Completed,
                    work: None,
                    result: Some(Ok(value)),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// A future that was cancelled before it ever ran. Returned when
    /// submission is rejected during shutdown.
    pub fn cancelled() -> Self {
        TaskFuture {
            cell: Arc::new(TaskCell {
                inner: Mutex::new(CellInner {
                    state: TaskState::Cancelled,
                    work: None,
                    result: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Blocks until the task completes or is cancelled, consuming the future.
    pub fn get(self) -> Result<T, TaskError> {
        self.cell.wait_locked(None)?;
        self.cell.take_result()
    }

    pub fn get_timeout(self, timeout: Duration) -> Result<T, TaskError> {
        self.cell.wait_locked(Some(Instant::now() + timeout))?;
        self.cell.take_result()
    }

    /// Blocks until the task finishes one way or the other, without
    /// consuming the result.
    pub fn wait(&self) {
        let _ = self.cell.wait_locked(None);
    }

    pub fn is_done(&self) -> bool {
        let inner = self.cell.inner.lock();
        matches!(inner.state, TaskState::Completed | TaskState::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.inner.lock().state == TaskState::Cancelled
    }

    /// Attempts to cancel; returns true only if the task had not started.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }
}

/// Type-erased view of a queued cell, what the worker loop actually runs.
/// `Sync` because the queued `Arc`s are shared between producer threads and
/// the worker.
pub trait QueuedTask: Send + Sync {
    fn run(&self);
    fn cancel(&self);
}

impl<T: Send + 'static> QueuedTask for TaskCell<T> {
    fn run(&self) {
        TaskCell::run(self)
    }

    fn cancel(&self) {
        TaskCell::cancel(self);
    }
}

static_assertions::assert_impl_all!(std::sync::Arc<dyn QueuedTask>: Send, Sync);

struct QueueInner {
    deque: VecDeque<Arc<dyn QueuedTask>>,
    woken: bool,
}

/// Bounded blocking deque between producer threads and the context thread.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        TaskQueue {
            inner: Mutex::new(QueueInner {
                deque: VecDeque::with_capacity(capacity),
                woken: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Appends `task`, blocking up to `timeout` for space. Returns false if
    /// the queue stayed full.
    pub fn offer(&self, task: Arc<dyn QueuedTask>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.deque.len() >= self.capacity {
            if self.not_full.wait_until(&mut inner, deadline).timed_out()
                && inner.deque.len() >= self.capacity
            {
                return false;
            }
        }
        inner.deque.push_back(task);
        self.not_empty.notify_one();
        true
    }

    /// Inserts `task` at the head, ignoring the capacity bound. Reserved for
    /// internal priority work such as orphan-handle disposal.
    pub fn push_front(&self, task: Arc<dyn QueuedTask>) {
        let mut inner = self.inner.lock();
        inner.deque.push_front(task);
        self.not_empty.notify_one();
    }

    /// Blocks for the next task. Returns `None` when woken by [`wake_all`]
    /// with the queue empty, which the worker treats as a shutdown check.
    ///
    /// [`wake_all`]: TaskQueue::wake_all
    pub fn take(&self) -> Option<Arc<dyn QueuedTask>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(task) = inner.deque.pop_front() {
                self.not_full.notify_one();
                return Some(task);
            }
            if inner.woken {
                inner.woken = false;
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Wakes every blocked consumer so it can re-check the lifecycle status.
    pub fn wake_all(&self) {
        let mut inner = self.inner.lock();
        inner.woken = true;
        self.not_empty.notify_all();
    }

    /// Removes and cancels every queued task.
    pub fn drain_cancel(&self) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.deque.drain(..).collect()
        };
        self.not_full.notify_all();
        for task in drained {
            task.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().deque.is_empty()
    }
}
