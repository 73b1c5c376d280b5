//! Virtual-time scheduler for deterministic tests of time-based behaviour.
//!
//! Time only moves when the test says so. Tasks run synchronously, on the
//! thread advancing the clock, in the order of their target time and, for
//! equal times, in submission order, so every run replays identically.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use rxflow::prelude::*;
//!
//! let scheduler = TestScheduler::new();
//! let worker = scheduler.create_worker();
//! let fired = Arc::new(Mutex::new(Vec::new()));
//!
//! let f = fired.clone();
//! let w = worker.clone();
//! worker.schedule_fn_after(Duration::from_millis(100), move || f.lock().unwrap().push(w.now()));
//!
//! scheduler.advance_time_by(Duration::from_millis(99));
//! assert!(fired.lock().unwrap().is_empty());
//!
//! scheduler.advance_time_by(Duration::from_millis(1));
//! assert_eq!(*fired.lock().unwrap(), vec![Duration::from_millis(100)]);
//! ```
//!
//! # Isolation
//!
//! Every [`TestScheduler::new`] is an independent clock and queue, so tests
//! running in parallel never observe each other. Clones share the same
//! clock.

use std::{
  collections::BTreeMap,
  sync::{Arc, Weak},
};

use parking_lot::Mutex;

use super::{Action, Duration, Scheduler, TaskHandle, Worker, WorkerRef};
use crate::{
  disposable::{CompositeDisposable, Disposable},
  hooks::{guard, report_uncaught},
};

// ==================== Internal State ====================

/// Target time, then submission order.
type TaskKey = (Duration, u64);

#[derive(Default)]
struct State {
  now: Duration,
  queue: BTreeMap<TaskKey, ScheduledTask>,
  seq: u64,
}

struct ScheduledTask {
  handle: TaskHandle,
  owner: Arc<CompositeDisposable>,
  action: Action,
}

impl ScheduledTask {
  fn run(self) {
    if self.owner.is_disposed() || !self.handle.begin_run() {
      return;
    }
    if let Err(err) = guard(self.action) {
      tracing::warn!(error = %err, "virtual-time task panicked");
      report_uncaught(err);
    }
    self.handle.finish();
  }
}

// ==================== TestScheduler ====================

/// A scheduler whose clock starts at zero and only advances when told to.
#[derive(Clone, Default)]
pub struct TestScheduler {
  state: Arc<Mutex<State>>,
}

impl TestScheduler {
  pub fn new() -> Self { Self::default() }

  /// Current virtual time.
  pub fn now(&self) -> Duration { self.state.lock().now }

  /// Number of tasks waiting in the queue.
  pub fn pending_count(&self) -> usize { self.state.lock().queue.len() }

  /// Runs every task due at or before `target`, each with the clock set to
  /// its target time, then sets the clock to `target`.
  ///
  /// Tasks scheduled by running tasks are picked up in the same call when
  /// they are due. The clock never moves backwards: a `target` in the past
  /// only runs what is due now.
  pub fn advance_time_to(&self, target: Duration) {
    while let Some(task) = self.pop_due(Some(target)) {
      task.run();
    }
    let mut state = self.state.lock();
    if target > state.now {
      state.now = target;
    }
  }

  /// `advance_time_to(now() + delta)`, saturating at [`Duration::MAX`].
  pub fn advance_time_by(&self, delta: Duration) {
    let target = self.now().saturating_add(delta);
    self.advance_time_to(target);
  }

  /// Runs the tasks due at the current time without moving the clock.
  pub fn trigger_actions(&self) { self.advance_time_to(self.now()) }

  /// Runs every queued task, moving the clock to each one's target time.
  ///
  /// Never returns while tasks keep rescheduling themselves.
  pub fn flush(&self) {
    while let Some(task) = self.pop_due(None) {
      task.run();
    }
  }

  fn pop_due(&self, limit: Option<Duration>) -> Option<ScheduledTask> {
    let mut state = self.state.lock();
    let (&(at, _), _) = state.queue.first_key_value()?;
    if limit.is_some_and(|limit| at > limit) {
      return None;
    }
    let (_, task) = state.queue.pop_first()?;
    if at > state.now {
      state.now = at;
    }
    Some(task)
  }

  /// Like [`create_worker`](Scheduler::create_worker), keeping the concrete
  /// type.
  pub fn create_test_worker(&self) -> Arc<TestWorker> {
    Arc::new(TestWorker { scheduler: self.clone(), tasks: Arc::new(CompositeDisposable::new()) })
  }
}

impl Scheduler for TestScheduler {
  fn create_worker(&self) -> WorkerRef { self.create_test_worker() }

  fn now(&self) -> Duration { TestScheduler::now(self) }
}

// ==================== TestWorker ====================

/// Worker of a [`TestScheduler`]. Its pending tasks are held in a
/// container, so disposing the worker removes them from the queue.
pub struct TestWorker {
  scheduler: TestScheduler,
  tasks: Arc<CompositeDisposable>,
}

impl Worker for TestWorker {
  fn schedule_after(&self, delay: Duration, action: Action) -> TaskHandle {
    if self.tasks.is_disposed() {
      return TaskHandle::cancelled();
    }
    let handle = TaskHandle::new();
    let registered = handle.as_disposable();
    if !self.tasks.add(registered.clone()) {
      return handle;
    }

    let tasks = Arc::downgrade(&self.tasks);
    let entry = Arc::downgrade(&registered);
    let action: Action = Box::new(move || {
      if let (Some(tasks), Some(entry)) = (tasks.upgrade(), entry.upgrade()) {
        tasks.remove(&entry);
      }
      action();
    });

    let key = {
      let mut state = self.scheduler.state.lock();
      let key = (state.now.saturating_add(delay), state.seq);
      state.seq += 1;
      let task = ScheduledTask { handle: handle.clone(), owner: self.tasks.clone(), action };
      state.queue.insert(key, task);
      key
    };

    let queue = Arc::downgrade(&self.scheduler.state);
    let tasks = Arc::downgrade(&self.tasks);
    let entry = Arc::downgrade(&registered);
    handle.set_on_cancel(move || {
      if let (Some(tasks), Some(entry)) = (tasks.upgrade(), entry.upgrade()) {
        tasks.remove(&entry);
      }
      dequeue(&queue, key);
    });
    handle
  }

  fn now(&self) -> Duration { self.scheduler.now() }
}

/// Removes a cancelled task from the queue. The task is dropped after the
/// lock is released since its action may own arbitrary resources.
fn dequeue(queue: &Weak<Mutex<State>>, key: TaskKey) {
  if let Some(state) = queue.upgrade() {
    let removed = state.lock().queue.remove(&key);
    drop(removed);
  }
}

impl Disposable for TestWorker {
  fn dispose(&self) { self.tasks.dispose() }

  fn is_disposed(&self) -> bool { self.tasks.is_disposed() }
}
