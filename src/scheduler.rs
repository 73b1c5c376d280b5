//! Schedulers and workers.
//!
//! A [`Scheduler`] is a factory of [`Worker`]s plus a clock. A worker is a
//! strand of sequential execution: tasks scheduled on one worker never run
//! concurrently with each other, and none runs after the worker (or the
//! task's own [`TaskHandle`]) has been disposed.
//!
//! Two implementations are provided:
//!
//! - [`EventLoopScheduler`]: a fixed pool of event-loop threads shared by the
//!   whole process, workers assigned round-robin;
//! - [`TestScheduler`]: virtual time advanced by hand, for deterministic
//!   tests of time-dependent behaviour.

use std::{
  future::Future,
  pin::Pin,
  sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
  },
  task::{Context, Poll},
};

pub use std::time::Duration;

use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::disposable::{Disposable, DisposableRef, SerialDisposable};

mod event_loop;
mod test_scheduler;

pub use event_loop::{EventLoopScheduler, EventLoopWorker};
pub use test_scheduler::{TestScheduler, TestWorker};

/// A unit of work handed to a worker.
pub type Action = Box<dyn FnOnce() + Send>;

// ==================== Traits ====================

/// Factory of workers sharing one clock.
pub trait Scheduler: Send + Sync {
  /// A new worker with its own cancellation scope.
  fn create_worker(&self) -> WorkerRef;

  /// The scheduler's clock, measured from an arbitrary fixed origin.
  fn now(&self) -> Duration;

  /// Runs `action` after `delay` without the caller managing a worker.
  fn schedule_direct(&self, delay: Duration, action: Action) -> TaskHandle {
    let worker = self.create_worker();
    let owner = worker.clone();
    worker.schedule_after(
      delay,
      Box::new(move || {
        action();
        owner.dispose();
      }),
    )
  }
}

pub type SchedulerRef = Arc<dyn Scheduler>;

/// A sequential execution context obtained from a [`Scheduler`].
///
/// Disposing a worker cancels every pending task and rejects new ones:
/// scheduling on a disposed worker returns an already cancelled handle.
pub trait Worker: Disposable {
  /// Runs `action` at `now() + delay`. Equal-time tasks run in submission
  /// order.
  fn schedule_after(&self, delay: Duration, action: Action) -> TaskHandle;

  /// Runs `action` as soon as possible, after tasks already due.
  fn schedule(&self, action: Action) -> TaskHandle { self.schedule_after(Duration::ZERO, action) }

  fn now(&self) -> Duration;
}

pub type WorkerRef = Arc<dyn Worker>;

/// Closure-friendly scheduling on any worker.
pub trait WorkerExt: Worker {
  fn schedule_fn(&self, action: impl FnOnce() + Send + 'static) -> TaskHandle {
    self.schedule(Box::new(action))
  }

  fn schedule_fn_after(
    &self, delay: Duration, action: impl FnOnce() + Send + 'static,
  ) -> TaskHandle {
    self.schedule_after(delay, Box::new(action))
  }
}

impl<W: Worker + ?Sized> WorkerExt for W {}

impl<W: Worker + ?Sized> Worker for Arc<W> {
  #[inline]
  fn schedule_after(&self, delay: Duration, action: Action) -> TaskHandle {
    (**self).schedule_after(delay, action)
  }

  #[inline]
  fn schedule(&self, action: Action) -> TaskHandle { (**self).schedule(action) }

  #[inline]
  fn now(&self) -> Duration { (**self).now() }
}

/// The worker as a plain disposable, for storing it in a container.
pub fn worker_disposable(worker: &WorkerRef) -> DisposableRef { Arc::new(worker.clone()) }

// ==================== TaskHandle ====================

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

type CancelHook = Box<dyn FnOnce() + Send>;

/// Handle to one scheduled task.
///
/// Disposing it before the task starts prevents it from running; disposing
/// it afterwards is a no-op. Awaiting it resolves once the task has finished
/// or was cancelled.
#[derive(Clone)]
pub struct TaskHandle(Arc<TaskState>);

struct TaskState {
  state: AtomicU8,
  on_cancel: Mutex<Option<CancelHook>>,
  waker: AtomicWaker,
}

impl TaskHandle {
  pub(crate) fn new() -> Self {
    Self(Arc::new(TaskState {
      state: AtomicU8::new(PENDING),
      on_cancel: Mutex::new(None),
      waker: AtomicWaker::new(),
    }))
  }

  /// A handle that is already cancelled, returned by disposed workers.
  pub fn cancelled() -> Self {
    let handle = Self::new();
    handle.0.state.store(CANCELLED, Ordering::Release);
    handle
  }

  /// Registers `hook` to run when the handle is cancelled before finishing.
  /// Runs it immediately when that already happened.
  pub(crate) fn set_on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
    let mut slot = self.0.on_cancel.lock();
    if self.0.state.load(Ordering::Acquire) == CANCELLED {
      drop(slot);
      hook();
      return;
    }
    *slot = Some(Box::new(hook));
  }

  /// Claims the task for execution. `false` means it was cancelled.
  pub(crate) fn begin_run(&self) -> bool {
    self
      .0
      .state
      .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub(crate) fn finish(&self) {
    let _ = self
      .0
      .state
      .compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Acquire);
    self.0.on_cancel.lock().take();
    self.0.waker.wake();
  }

  pub fn is_finished(&self) -> bool { self.0.state.load(Ordering::Acquire) == FINISHED }

  pub fn is_cancelled(&self) -> bool { self.0.state.load(Ordering::Acquire) == CANCELLED }

  /// The handle as a [`DisposableRef`]. Every call returns the same
  /// allocation, so the result can be removed from a container later.
  pub fn as_disposable(&self) -> DisposableRef { self.0.clone() }
}

impl Disposable for TaskState {
  fn dispose(&self) {
    let cancelled = self
      .state
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
        matches!(s, PENDING | RUNNING).then_some(CANCELLED)
      })
      .is_ok();
    if cancelled {
      let hook = self.on_cancel.lock().take();
      if let Some(hook) = hook {
        hook();
      }
      self.waker.wake();
    }
  }

  fn is_disposed(&self) -> bool {
    matches!(self.state.load(Ordering::Acquire), FINISHED | CANCELLED)
  }
}

impl Disposable for TaskHandle {
  #[inline]
  fn dispose(&self) { self.0.dispose() }

  #[inline]
  fn is_disposed(&self) -> bool { self.0.is_disposed() }
}

impl Future for TaskHandle {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    if self.is_disposed() {
      return Poll::Ready(());
    }
    self.0.waker.register(cx.waker());
    if self.is_disposed() {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }
}

// ==================== Periodic ====================

/// Runs `action` after `initial`, then every `period`, until the returned
/// handle or the worker is disposed.
///
/// Each run is scheduled from the previous target time rather than from
/// when the previous run finished, so slow runs do not accumulate drift.
pub fn schedule_periodic(
  worker: &WorkerRef, initial: Duration, period: Duration,
  action: impl FnMut() + Send + 'static,
) -> DisposableRef {
  let serial = Arc::new(SerialDisposable::new());
  let start = worker.now().saturating_add(initial);
  let tick = Arc::new(Periodic {
    worker: worker.clone(),
    serial: serial.clone(),
    period,
    action: Mutex::new(Box::new(action)),
  });
  tick.arm(start, initial);
  serial
}

struct Periodic {
  worker: WorkerRef,
  serial: Arc<SerialDisposable>,
  period: Duration,
  action: Mutex<Box<dyn FnMut() + Send>>,
}

impl Periodic {
  fn arm(self: &Arc<Self>, target: Duration, delay: Duration) {
    let this = self.clone();
    let handle = self.worker.schedule_fn_after(delay, move || this.run(target));
    self.serial.set(handle.as_disposable());
  }

  fn run(self: &Arc<Self>, target: Duration) {
    if self.serial.is_disposed() {
      return;
    }
    (&mut **self.action.lock())();
    let next = target.saturating_add(self.period);
    let delay = next.saturating_sub(self.worker.now());
    self.arm(next, delay);
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use super::*;

  #[rxflow_macro::test]
  fn handle_lifecycle() {
    let handle = TaskHandle::new();
    assert!(!handle.is_disposed());
    assert!(handle.begin_run());
    handle.finish();
    assert!(handle.is_finished());
    handle.dispose();
    assert!(!handle.is_cancelled());
  }

  #[rxflow_macro::test]
  fn cancelled_handle_never_runs() {
    let handle = TaskHandle::new();
    let hooks = Arc::new(AtomicUsize::new(0));
    let h = hooks.clone();
    handle.set_on_cancel(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    handle.dispose();
    handle.dispose();
    assert!(!handle.begin_run());
    assert_eq!(hooks.load(Ordering::SeqCst), 1);

    let h = hooks.clone();
    TaskHandle::cancelled().set_on_cancel(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(hooks.load(Ordering::SeqCst), 2);
  }

  #[rxflow_macro::test]
  fn as_disposable_is_identity_stable() {
    let handle = TaskHandle::new();
    let a = handle.as_disposable();
    let b = handle.as_disposable();
    assert!(crate::disposable::same_disposable(&a, &b));
    b.dispose();
    assert!(handle.is_cancelled());
  }

  #[rxflow_macro::test]
  fn periodic_runs_until_disposed() {
    let scheduler = TestScheduler::new();
    let worker = scheduler.create_worker();
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let periodic =
      schedule_periodic(&worker, Duration::from_millis(10), Duration::from_millis(5), move || {
        t.fetch_add(1, Ordering::SeqCst);
      });

    scheduler.advance_time_by(Duration::from_millis(9));
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    scheduler.advance_time_by(Duration::from_millis(11));
    // 10, 15, 20
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    periodic.dispose();
    scheduler.advance_time_by(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.pending_count(), 0);
  }

  #[rxflow_macro::test]
  async fn handle_resolves_when_cancelled() {
    let handle = TaskHandle::new();
    let waiter = handle.clone();
    handle.dispose();
    waiter.await;
  }
}
