//! Time-shifting operators.
//!
//! Both variants pass demand straight through: a value waiting for its
//! moment still counts against the consumer's request, so the source never
//! gets further ahead than the consumer asked for.

use std::{marker::PhantomData, sync::Arc};

use parking_lot::Mutex;

use crate::{
  disposable::DisposableRef,
  error::Error,
  hooks::guard,
  observer::{BoxedSubscriber, Subscriber},
  publisher::Publisher,
  scheduler::{worker_disposable, Duration, SchedulerRef, WorkerExt, WorkerRef},
  subscription::{cancel_on_dispose, SubscriptionArbiter, SubscriptionRef, UNBOUNDED},
};

// ==================== Timed ====================

/// See [`PublisherExt::delay`](super::PublisherExt::delay).
pub struct Delay<P, T> {
  source: P,
  delay: Duration,
  scheduler: SchedulerRef,
  _marker: PhantomData<fn() -> T>,
}

impl<P, T> Delay<P, T> {
  pub(crate) fn new(source: P, delay: Duration, scheduler: SchedulerRef) -> Self {
    Delay { source, delay, scheduler, _marker: PhantomData }
  }
}

impl<P, T> Publisher<T> for Delay<P, T>
where
  P: Publisher<T>,
  T: Send + 'static,
{
  fn subscribe(&self, subscriber: BoxedSubscriber<T>) {
    let arbiter = SubscriptionArbiter::attach(subscriber);
    let worker = self.scheduler.create_worker();
    if !arbiter.resources().add(worker_disposable(&worker)) {
      return;
    }
    self.source.subscribe(Box::new(DelaySubscriber {
      arbiter,
      worker,
      delay: self.delay,
      generation: None,
    }));
  }
}

struct DelaySubscriber<T> {
  arbiter: Arc<SubscriptionArbiter<T>>,
  worker: WorkerRef,
  delay: Duration,
  generation: Option<u64>,
}

impl<T: Send + 'static> Subscriber<T> for DelaySubscriber<T> {
  fn attach(&mut self, subscription: SubscriptionRef) {
    if self.generation.is_some() {
      subscription.cancel();
      return;
    }
    self.generation = self.arbiter.set_subscription(subscription);
  }

  fn next(&mut self, value: T) {
    let Some(generation) = self.generation else {
      return;
    };
    let arbiter = self.arbiter.clone();
    self.worker.schedule_fn_after(self.delay, move || {
      arbiter.next(generation, value);
    });
  }

  /// Errors are not delayed; values still waiting are dropped.
  fn error(&mut self, err: Error) {
    match self.generation {
      Some(generation) => self.arbiter.error(generation, err),
      None => tracing::trace!(error = %err, "error before attach dropped"),
    }
  }

  fn complete(&mut self) {
    let Some(generation) = self.generation else {
      return;
    };
    let arbiter = self.arbiter.clone();
    self.worker.schedule_fn_after(self.delay, move || arbiter.complete(generation));
  }
}

// ==================== Selector ====================

/// See [`PublisherExt::delay_with`](super::PublisherExt::delay_with).
pub struct DelayWith<P, F, T, D, U> {
  source: P,
  selector: Arc<F>,
  _marker: PhantomData<fn() -> (T, D, U)>,
}

impl<P, F, T, D, U> DelayWith<P, F, T, D, U> {
  pub(crate) fn new(source: P, selector: F) -> Self {
    DelayWith { source, selector: Arc::new(selector), _marker: PhantomData }
  }
}

impl<P, F, T, D, U> Publisher<T> for DelayWith<P, F, T, D, U>
where
  P: Publisher<T>,
  F: Fn(&T) -> D + Send + Sync + 'static,
  D: Publisher<U> + 'static,
  T: Send + 'static,
  U: Send + 'static,
{
  fn subscribe(&self, subscriber: BoxedSubscriber<T>) {
    let shared = Arc::new(Shared {
      arbiter: SubscriptionArbiter::attach(subscriber),
      selector: self.selector.clone(),
      progress: Mutex::new(Progress::default()),
    });
    self.source.subscribe(Box::new(SourceSubscriber {
      shared,
      generation: None,
      _marker: PhantomData::<fn() -> (D, U)>,
    }));
  }
}

struct Shared<T, F> {
  arbiter: Arc<SubscriptionArbiter<T>>,
  selector: Arc<F>,
  progress: Mutex<Progress>,
}

#[derive(Default)]
struct Progress {
  /// Values waiting for their delayer.
  waiting: usize,
  source_done: bool,
}

impl<T: Send + 'static, F> Shared<T, F> {
  /// Completes once the source is done and nothing is waiting any more.
  fn settle(&self, generation: u64, progress: impl FnOnce(&mut Progress)) {
    let finished = {
      let mut p = self.progress.lock();
      progress(&mut p);
      p.source_done && p.waiting == 0
    };
    if finished {
      self.arbiter.complete(generation);
    }
  }
}

struct SourceSubscriber<T, F, D, U> {
  shared: Arc<Shared<T, F>>,
  generation: Option<u64>,
  _marker: PhantomData<fn() -> (D, U)>,
}

impl<T, F, D, U> Subscriber<T> for SourceSubscriber<T, F, D, U>
where
  F: Fn(&T) -> D + Send + Sync + 'static,
  D: Publisher<U>,
  T: Send + 'static,
  U: Send + 'static,
{
  fn attach(&mut self, subscription: SubscriptionRef) {
    if self.generation.is_some() {
      subscription.cancel();
      return;
    }
    self.generation = self.shared.arbiter.set_subscription(subscription);
  }

  fn next(&mut self, value: T) {
    let Some(generation) = self.generation else {
      return;
    };
    if self.shared.arbiter.is_terminated() {
      return;
    }
    let selector: &F = &self.shared.selector;
    let delayer = match guard(|| selector(&value)) {
      Ok(delayer) => delayer,
      Err(err) => {
        self.shared.arbiter.fail(err);
        return;
      }
    };
    self.shared.progress.lock().waiting += 1;
    delayer.subscribe(Box::new(ItemTrigger {
      shared: self.shared.clone(),
      generation,
      value: Some(value),
      registration: None,
    }));
  }

  /// Errors are not delayed; values still waiting are dropped.
  fn error(&mut self, err: Error) {
    match self.generation {
      Some(generation) => self.shared.arbiter.error(generation, err),
      None => tracing::trace!(error = %err, "error before attach dropped"),
    }
  }

  fn complete(&mut self) {
    if let Some(generation) = self.generation {
      self.shared.settle(generation, |p| p.source_done = true);
    }
  }
}

/// Holds one value until its delayer emits or completes.
struct ItemTrigger<T, F> {
  shared: Arc<Shared<T, F>>,
  generation: u64,
  value: Option<T>,
  /// The delayer's subscription as held by the arbiter's resources.
  registration: Option<DisposableRef>,
}

impl<T: Send + 'static, F> ItemTrigger<T, F> {
  /// Takes the value and releases the delayer. `None` when already fired.
  fn fire(&mut self) -> Option<T> {
    let value = self.value.take()?;
    if let Some(registration) = self.registration.take() {
      self.shared.arbiter.resources().delete(&registration);
    }
    Some(value)
  }

  fn release(&mut self) {
    if let Some(value) = self.fire() {
      self.shared.arbiter.next(self.generation, value);
      self.shared.settle(self.generation, |p| p.waiting = p.waiting.saturating_sub(1));
    }
  }
}

impl<T, F, U> Subscriber<U> for ItemTrigger<T, F>
where
  T: Send + 'static,
  F: Send + Sync,
{
  fn attach(&mut self, subscription: SubscriptionRef) {
    if self.value.is_none() || self.registration.is_some() {
      subscription.cancel();
      return;
    }
    let registration = cancel_on_dispose(subscription.clone());
    if !self.shared.arbiter.resources().add(registration.clone()) {
      return;
    }
    self.registration = Some(registration);
    subscription.request(UNBOUNDED);
  }

  fn next(&mut self, _value: U) { self.release(); }

  fn error(&mut self, err: Error) {
    if self.fire().is_some() {
      self.shared.arbiter.fail(err);
    }
  }

  fn complete(&mut self) { self.release(); }
}
