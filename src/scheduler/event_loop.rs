//! A fixed pool of event-loop threads.
//!
//! The pool is sized once, from [`SchedulerConfig::pool_size`], when the
//! scheduler is built. Every logical worker is pinned to one loop, chosen
//! round-robin, so its tasks run sequentially on that loop's thread while
//! different workers spread across the pool.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::mpsc;
//! use rxflow::prelude::*;
//!
//! let scheduler = EventLoopScheduler::shared().unwrap();
//! let worker = scheduler.create_worker();
//!
//! let (tx, rx) = mpsc::channel();
//! worker.schedule_fn_after(Duration::from_millis(5), move || tx.send("tick").unwrap());
//! assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("tick"));
//! worker.dispose();
//! ```

use std::{
  collections::BTreeMap,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
  },
  thread,
  time::Instant,
};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use super::{Action, Duration, Scheduler, TaskHandle, Worker, WorkerRef};
use crate::{
  config::SchedulerConfig,
  disposable::{CompositeDisposable, Disposable},
  error::Error,
  hooks::{guard, report_uncaught},
};

static SHARED: Lazy<Result<EventLoopScheduler, Error>> =
  Lazy::new(|| EventLoopScheduler::new(SchedulerConfig::from_env()));

// ==================== Scheduler ====================

/// Scheduler backed by a fixed pool of event-loop threads.
///
/// Cloning is cheap and shares the pool. The threads stop once the last
/// clone is dropped; pending tasks are cancelled then, and workers that
/// outlive the scheduler only hand out cancelled handles.
#[derive(Clone)]
pub struct EventLoopScheduler {
  pool: Arc<FixedPool>,
}

struct FixedPool {
  loops: Vec<Arc<EventLoop>>,
  next: AtomicUsize,
  origin: Instant,
}

impl EventLoopScheduler {
  /// Starts `config.pool_size()` event-loop threads.
  pub fn new(config: SchedulerConfig) -> Result<Self, Error> {
    let size = config.pool_size();
    let mut loops = Vec::with_capacity(size);
    for index in 0..size {
      let event_loop = Arc::new(EventLoop::default());
      let runner = event_loop.clone();
      thread::Builder::new()
        .name(format!("{}{index}", config.thread_name_prefix))
        .spawn(move || runner.run())
        .map_err(Error::other)?;
      loops.push(event_loop);
    }
    tracing::debug!(threads = size, "event loop pool started");
    Ok(Self {
      pool: Arc::new(FixedPool { loops, next: AtomicUsize::new(0), origin: Instant::now() }),
    })
  }

  /// The process-wide pool, configured from the environment on first use.
  pub fn shared() -> Result<&'static Self, Error> { SHARED.as_ref().map_err(Clone::clone) }

  pub fn pool_size(&self) -> usize { self.pool.loops.len() }

  /// Like [`create_worker`](Scheduler::create_worker), keeping the
  /// concrete type.
  pub fn create_event_loop_worker(&self) -> Arc<EventLoopWorker> {
    let slot = self.pool.next_slot();
    Arc::new(EventLoopWorker {
      event_loop: self.pool.loops[slot].clone(),
      slot,
      tasks: Arc::new(CompositeDisposable::new()),
      origin: self.pool.origin,
    })
  }
}

impl FixedPool {
  /// Round-robin. The counter wraps on overflow; the modulo keeps the slot
  /// in range either way.
  fn next_slot(&self) -> usize { self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len() }
}

impl Drop for FixedPool {
  fn drop(&mut self) {
    for event_loop in &self.loops {
      event_loop.shutdown();
    }
  }
}

impl Scheduler for EventLoopScheduler {
  fn create_worker(&self) -> WorkerRef { self.create_event_loop_worker() }

  fn now(&self) -> Duration { self.pool.origin.elapsed() }

  /// Submits straight to a pool thread, without a logical worker or any
  /// container bookkeeping.
  fn schedule_direct(&self, delay: Duration, action: Action) -> TaskHandle {
    let handle = TaskHandle::new();
    let slot = self.pool.next_slot();
    let event_loop = &self.pool.loops[slot];
    if let Some(key) = event_loop.submit(Due::after(delay), handle.clone(), action) {
      let queue = Arc::downgrade(event_loop);
      handle.set_on_cancel(move || dequeue(&queue, key));
    }
    handle
  }
}

// ==================== Worker ====================

/// A logical worker pinned to one event loop.
///
/// Disposing it cancels only the tasks it scheduled; the loop thread keeps
/// serving other workers.
pub struct EventLoopWorker {
  event_loop: Arc<EventLoop>,
  slot: usize,
  tasks: Arc<CompositeDisposable>,
  origin: Instant,
}

impl EventLoopWorker {
  /// Index of the pool loop this worker runs on.
  pub fn slot(&self) -> usize { self.slot }
}

impl Worker for EventLoopWorker {
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
    let unregister = move || {
      if let (Some(tasks), Some(entry)) = (tasks.upgrade(), entry.upgrade()) {
        tasks.remove(&entry);
      }
    };

    let run_unregister = unregister.clone();
    let action: Action = Box::new(move || {
      run_unregister();
      action();
    });
    let key = self.event_loop.submit(Due::after(delay), handle.clone(), action);
    let queue = Arc::downgrade(&self.event_loop);
    handle.set_on_cancel(move || {
      unregister();
      if let Some(key) = key {
        dequeue(&queue, key);
      }
    });
    handle
  }

  fn now(&self) -> Duration { self.origin.elapsed() }
}

impl Disposable for EventLoopWorker {
  fn dispose(&self) { self.tasks.dispose() }

  fn is_disposed(&self) -> bool { self.tasks.is_disposed() }
}

// ==================== Event loop ====================

#[derive(Default)]
struct EventLoop {
  queue: Mutex<LoopQueue>,
  wakeup: Condvar,
}

/// When a task becomes due. Deadlines past the end of the platform clock
/// are never due; such a task only leaves the queue by being cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Due {
  At(Instant),
  Never,
}

impl Due {
  fn after(delay: Duration) -> Self {
    Instant::now().checked_add(delay).map_or(Due::Never, Due::At)
  }
}

/// Deadline, then submission order.
type LoopKey = (Due, u64);

#[derive(Default)]
struct LoopQueue {
  tasks: BTreeMap<LoopKey, Entry>,
  seq: u64,
  shutdown: bool,
}

struct Entry {
  handle: TaskHandle,
  action: Action,
}

/// Removes a cancelled task from its loop. The entry is dropped after the
/// lock is released since its action may own arbitrary resources.
fn dequeue(event_loop: &Weak<EventLoop>, key: LoopKey) {
  if let Some(event_loop) = event_loop.upgrade() {
    let removed = event_loop.queue.lock().tasks.remove(&key);
    drop(removed);
  }
}

impl EventLoop {
  /// Queues the task. `None`, with the handle cancelled, once shut down.
  fn submit(&self, due: Due, handle: TaskHandle, action: Action) -> Option<LoopKey> {
    let mut queue = self.queue.lock();
    if queue.shutdown {
      drop(queue);
      handle.dispose();
      return None;
    }
    let key = (due, queue.seq);
    queue.seq += 1;
    queue.tasks.insert(key, Entry { handle, action });
    self.wakeup.notify_one();
    Some(key)
  }

  fn shutdown(&self) {
    let dropped = {
      let mut queue = self.queue.lock();
      queue.shutdown = true;
      std::mem::take(&mut queue.tasks)
    };
    self.wakeup.notify_one();
    for entry in dropped.into_values() {
      entry.handle.dispose();
    }
  }

  fn run(&self) {
    while let Some(entry) = self.next_due() {
      if !entry.handle.begin_run() {
        continue;
      }
      if let Err(err) = guard(entry.action) {
        tracing::warn!(error = %err, "scheduled task panicked");
        report_uncaught(err);
      }
      entry.handle.finish();
    }
    tracing::trace!("event loop stopped");
  }

  /// Blocks until the earliest task is due. `None` once shut down.
  fn next_due(&self) -> Option<Entry> {
    let mut queue = self.queue.lock();
    loop {
      if queue.shutdown {
        return None;
      }
      match queue.tasks.first_key_value().map(|(&(due, _), _)| due) {
        None | Some(Due::Never) => self.wakeup.wait(&mut queue),
        Some(Due::At(at)) if at <= Instant::now() => {
          return queue.tasks.pop_first().map(|(_, entry)| entry);
        }
        Some(Due::At(at)) => {
          self.wakeup.wait_until(&mut queue, at);
        }
      }
    }
  }
}
