//! Helpers for tests: a recording subscriber and test logging.

use std::{
  fmt::Debug,
  sync::{
    atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
  error::Error,
  observer::{BoxedSubscriber, Subscriber},
  publisher::Publisher,
  subscription::{add_cap, Subscription, SubscriptionRef},
};

/// Installs a `tracing` subscriber that writes through the test harness.
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A subscriber that records every signal it receives.
///
/// Clones share the same record, so one clone can be handed to a publisher
/// (see [`boxed`](Self::boxed)) while another drives demand and inspects
/// what arrived. Protocol violations, such as a signal after the terminal
/// one or a second `attach`, are recorded and fail the `assert_*` helpers.
///
/// ```rust
/// use rxflow::prelude::*;
///
/// let ts = TestSubscriber::new(1);
/// from_iter(vec!["a", "b"]).subscribe(ts.boxed());
/// ts.assert_values(&["a"]);
/// ts.request(1);
/// ts.request(1);
/// ts.assert_values(&["a", "b"]);
/// ts.assert_complete();
/// ```
pub struct TestSubscriber<T> {
  inner: Arc<Recorder<T>>,
}

struct Recorder<T> {
  initial_request: i64,
  record: Mutex<Record<T>>,
  changed: Condvar,
  subscription: Mutex<Option<SubscriptionRef>>,
}

struct Record<T> {
  values: Vec<T>,
  errors: Vec<Error>,
  completions: usize,
  violations: Vec<String>,
}

impl<T> Record<T> {
  fn is_terminated(&self) -> bool { self.completions + self.errors.len() > 0 }
}

impl<T> Clone for TestSubscriber<T> {
  fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T: Send + 'static> TestSubscriber<T> {
  /// A subscriber that requests `initial_request` on attach, or nothing
  /// when it is not positive.
  pub fn new(initial_request: i64) -> Self {
    Self {
      inner: Arc::new(Recorder {
        initial_request,
        record: Mutex::new(Record {
          values: Vec::new(),
          errors: Vec::new(),
          completions: 0,
          violations: Vec::new(),
        }),
        changed: Condvar::new(),
        subscription: Mutex::new(None),
      }),
    }
  }

  /// A boxed clone to hand to a publisher.
  pub fn boxed(&self) -> BoxedSubscriber<T> { Box::new(self.clone()) }
}

impl<T> TestSubscriber<T> {
  /// Requests `n` more values through the attached subscription.
  pub fn request(&self, n: i64) {
    let sub = self.inner.subscription.lock().clone();
    match sub {
      Some(sub) => sub.request(n),
      None => tracing::warn!(amount = n, "request before attach ignored"),
    }
  }

  pub fn cancel(&self) {
    let sub = self.inner.subscription.lock().clone();
    if let Some(sub) = sub {
      sub.cancel();
    }
  }

  pub fn errors(&self) -> Vec<Error> { self.inner.record.lock().errors.clone() }

  pub fn completions(&self) -> usize { self.inner.record.lock().completions }

  pub fn value_count(&self) -> usize { self.inner.record.lock().values.len() }

  pub fn is_terminated(&self) -> bool { self.inner.record.lock().is_terminated() }

  /// Waits up to `timeout` for a terminal signal. Returns whether one
  /// arrived.
  pub fn await_terminal(&self, timeout: Duration) -> bool {
    self.await_until(timeout, Record::is_terminated)
  }

  /// Waits up to `timeout` until at least `count` values arrived.
  pub fn await_count(&self, count: usize, timeout: Duration) -> bool {
    self.await_until(timeout, |r| r.values.len() >= count)
  }

  fn await_until(&self, timeout: Duration, done: impl Fn(&Record<T>) -> bool) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    let mut record = self.inner.record.lock();
    while !done(&record) {
      match deadline {
        Some(deadline) => {
          if self.inner.changed.wait_until(&mut record, deadline).timed_out() {
            return done(&record);
          }
        }
        None => self.inner.changed.wait(&mut record),
      }
    }
    true
  }

  #[track_caller]
  pub fn assert_no_errors(&self) {
    let record = self.inner.record.lock();
    assert!(record.errors.is_empty(), "unexpected errors: {:?}", record.errors);
    assert!(record.violations.is_empty(), "protocol violations: {:?}", record.violations);
  }

  /// Exactly one completion and nothing else terminal.
  #[track_caller]
  pub fn assert_complete(&self) {
    self.assert_no_errors();
    assert_eq!(self.completions(), 1, "expected exactly one completion");
  }

  /// Exactly one error, displaying as `message`, and no completion.
  #[track_caller]
  pub fn assert_error(&self, message: &str) {
    let record = self.inner.record.lock();
    assert!(record.violations.is_empty(), "protocol violations: {:?}", record.violations);
    assert_eq!(record.completions, 0, "unexpected completion");
    let messages: Vec<String> = record.errors.iter().map(ToString::to_string).collect();
    assert_eq!(messages, vec![message.to_owned()]);
  }
}

impl<T: Clone> TestSubscriber<T> {
  pub fn values(&self) -> Vec<T> { self.inner.record.lock().values.clone() }
}

impl<T: Clone + PartialEq + Debug> TestSubscriber<T> {
  #[track_caller]
  pub fn assert_values(&self, expected: &[T]) { assert_eq!(self.values(), expected); }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
  fn attach(&mut self, subscription: SubscriptionRef) {
    {
      let mut slot = self.inner.subscription.lock();
      if slot.is_some() {
        drop(slot);
        self.inner.record.lock().violations.push("attached twice".to_owned());
        subscription.cancel();
        return;
      }
      *slot = Some(subscription.clone());
    }
    if self.inner.initial_request > 0 {
      subscription.request(self.inner.initial_request);
    }
  }

  fn next(&mut self, value: T) {
    let mut record = self.inner.record.lock();
    if record.is_terminated() {
      record.violations.push("value after terminal signal".to_owned());
      return;
    }
    record.values.push(value);
    self.inner.changed.notify_all();
  }

  fn error(&mut self, err: Error) {
    let mut record = self.inner.record.lock();
    if record.is_terminated() {
      record.violations.push(format!("error after terminal signal: {err}"));
    }
    record.errors.push(err);
    self.inner.changed.notify_all();
  }

  fn complete(&mut self) {
    let mut record = self.inner.record.lock();
    if record.is_terminated() {
      record.violations.push("completion after terminal signal".to_owned());
    }
    record.completions += 1;
    self.inner.changed.notify_all();
  }
}

// ==================== TestPublisher ====================

/// A publisher driven by hand from the test body.
///
/// It serves one subscriber at a time, records the demand it receives and
/// whether it was cancelled, and emits only what the test tells it to, with
/// no regard for demand. Clones share the same state.
pub struct TestPublisher<T> {
  inner: Arc<Emitter<T>>,
}

struct Emitter<T> {
  subscriber: Mutex<Option<BoxedSubscriber<T>>>,
  subscription: Mutex<Arc<Recording>>,
  subscribe_count: AtomicUsize,
}

#[derive(Default)]
struct Recording {
  requested: AtomicI64,
  cancelled: AtomicBool,
}

impl Subscription for Recording {
  fn request(&self, n: i64) {
    let _ = self.requested.fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
      Some(add_cap(r, n))
    });
  }

  fn cancel(&self) { self.cancelled.store(true, Ordering::Release); }

  fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Acquire) }
}

impl<T> Clone for TestPublisher<T> {
  fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T> Default for TestPublisher<T> {
  fn default() -> Self { Self::new() }
}

impl<T> TestPublisher<T> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Emitter {
        subscriber: Mutex::new(None),
        subscription: Mutex::new(Arc::default()),
        subscribe_count: AtomicUsize::new(0),
      }),
    }
  }

  /// Total demand received from the current subscriber.
  pub fn requested(&self) -> i64 {
    self.inner.subscription.lock().requested.load(Ordering::Acquire)
  }

  /// Whether the current subscriber cancelled.
  pub fn is_cancelled(&self) -> bool { self.inner.subscription.lock().is_cancelled() }

  /// How many times `subscribe` was called.
  pub fn subscribe_count(&self) -> usize { self.inner.subscribe_count.load(Ordering::Acquire) }

  /// Pushes `value` to the current subscriber unless it cancelled.
  pub fn next(&self, value: T) {
    if self.is_cancelled() {
      return;
    }
    // Taken out for the call so the subscriber may re-enter.
    let Some(mut subscriber) = self.inner.subscriber.lock().take() else {
      return;
    };
    subscriber.next(value);
    let mut slot = self.inner.subscriber.lock();
    if slot.is_none() {
      *slot = Some(subscriber);
    }
  }

  pub fn complete(&self) {
    let subscriber = self.inner.subscriber.lock().take();
    if let Some(mut subscriber) = subscriber {
      subscriber.complete();
    }
  }

  pub fn error(&self, err: Error) {
    let subscriber = self.inner.subscriber.lock().take();
    if let Some(mut subscriber) = subscriber {
      subscriber.error(err);
    }
  }
}

impl<T: Send + 'static> Publisher<T> for TestPublisher<T> {
  fn subscribe(&self, mut subscriber: BoxedSubscriber<T>) {
    let subscription = Arc::new(Recording::default());
    *self.inner.subscription.lock() = subscription.clone();
    self.inner.subscribe_count.fetch_add(1, Ordering::AcqRel);
    subscriber.attach(subscription);
    *self.inner.subscriber.lock() = Some(subscriber);
  }
}
