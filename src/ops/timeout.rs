use std::{
  marker::PhantomData,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;

use crate::{
  disposable::{Disposable, SerialDisposable},
  error::Error,
  observer::{BoxedSubscriber, Subscriber},
  publisher::{Publisher, PublisherRef},
  scheduler::{worker_disposable, Duration, SchedulerRef, WorkerExt, WorkerRef},
  subscription::{SubscriptionArbiter, SubscriptionRef},
};

/// Index value once the timer has won.
const FIRED: u64 = u64::MAX;

/// See [`PublisherExt::timeout`](super::PublisherExt::timeout).
pub struct Timeout<P, T> {
  source: P,
  window: Duration,
  fallback: Option<PublisherRef<T>>,
  scheduler: SchedulerRef,
  _marker: PhantomData<fn() -> T>,
}

impl<P, T> Timeout<P, T> {
  pub(crate) fn new(
    source: P, window: Duration, fallback: Option<PublisherRef<T>>, scheduler: SchedulerRef,
  ) -> Self {
    Timeout { source, window, fallback, scheduler, _marker: PhantomData }
  }
}

impl<P, T> Publisher<T> for Timeout<P, T>
where
  P: Publisher<T>,
  T: Send + 'static,
{
  fn subscribe(&self, subscriber: BoxedSubscriber<T>) {
    let arbiter = SubscriptionArbiter::attach(subscriber);
    let worker = self.scheduler.create_worker();
    let timer = Arc::new(SerialDisposable::new());
    let resources = arbiter.resources();
    if !resources.add(worker_disposable(&worker)) || !resources.add(timer.clone()) {
      return;
    }

    let state = Arc::new(TimeoutState {
      arbiter,
      worker,
      timer,
      index: AtomicU64::new(0),
      gate: Mutex::new(()),
      window: self.window,
      fallback: self.fallback.clone(),
    });
    state.arm(0);
    self.source.subscribe(Box::new(TimeoutSubscriber { state, generation: None }));
  }
}

struct TimeoutState<T> {
  arbiter: Arc<SubscriptionArbiter<T>>,
  worker: WorkerRef,
  timer: Arc<SerialDisposable>,
  /// Values seen so far, or [`FIRED`].
  index: AtomicU64,
  /// Orders the source's attach against the timer firing.
  gate: Mutex<()>,
  window: Duration,
  fallback: Option<PublisherRef<T>>,
}

impl<T: Send + 'static> TimeoutState<T> {
  fn arm(self: &Arc<Self>, index: u64) {
    let state = self.clone();
    let task = self.worker.schedule_fn_after(self.window, move || state.fire(index));
    self.timer.set(task.as_disposable());
  }

  fn fire(&self, index: u64) {
    {
      let _gate = self.gate.lock();
      if self.index.compare_exchange(index, FIRED, Ordering::AcqRel, Ordering::Acquire).is_err() {
        return;
      }
      self.arbiter.detach();
    }
    match &self.fallback {
      Some(fallback) => {
        tracing::debug!(window = ?self.window, "timed out, switching to fallback");
        fallback.subscribe(Box::new(self.arbiter.upstream()));
      }
      None => {
        tracing::debug!(window = ?self.window, "timed out");
        self.arbiter.fail(Error::Timeout(self.window));
      }
    }
  }

  /// Claims the stream for a terminal signal from the source.
  fn settle(&self) -> bool {
    let claimed = self.index.swap(FIRED, Ordering::AcqRel) != FIRED;
    self.timer.dispose();
    claimed
  }
}

struct TimeoutSubscriber<T> {
  state: Arc<TimeoutState<T>>,
  generation: Option<u64>,
}

impl<T: Send + 'static> Subscriber<T> for TimeoutSubscriber<T> {
  fn attach(&mut self, subscription: SubscriptionRef) {
    if self.generation.is_some() {
      subscription.cancel();
      return;
    }
    let gate = self.state.gate.lock();
    if self.state.index.load(Ordering::Acquire) == FIRED {
      drop(gate);
      subscription.cancel();
      return;
    }
    self.generation = self.state.arbiter.set_subscription(subscription);
  }

  fn next(&mut self, value: T) {
    let Some(generation) = self.generation else {
      return;
    };
    let index = self.state.index.load(Ordering::Acquire);
    if index == FIRED
      || self
        .state
        .index
        .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
      tracing::trace!("value after timeout dropped");
      return;
    }
    self.state.arbiter.next(generation, value);
    self.state.arm(index + 1);
  }

  fn error(&mut self, err: Error) {
    match self.generation {
      Some(generation) if self.state.settle() => self.state.arbiter.error(generation, err),
      _ => tracing::trace!(error = %err, "error after timeout dropped"),
    }
  }

  fn complete(&mut self) {
    if let Some(generation) = self.generation {
      if self.state.settle() {
        self.state.arbiter.complete(generation);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    ops::PublisherExt,
    publisher::{never, range, timer},
    scheduler::TestScheduler,
    subscription::UNBOUNDED,
    testing::{TestPublisher, TestSubscriber},
  };

  fn ms(n: u64) -> Duration { Duration::from_millis(n) }

  #[rxflow_macro::test]
  fn values_inside_the_window_pass_through() {
    let scheduler = TestScheduler::new();
    let ts = TestSubscriber::new(UNBOUNDED);
    timer(ms(50), Arc::new(scheduler.clone()))
      .timeout(ms(100), Arc::new(scheduler.clone()))
      .subscribe(ts.boxed());

    scheduler.advance_time_by(ms(50));
    ts.assert_values(&[0]);
    ts.assert_complete();
    assert_eq!(scheduler.pending_count(), 0);
  }

  #[rxflow_macro::test]
  fn each_value_restarts_the_window() {
    let scheduler = TestScheduler::new();
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(10);
    source.clone().timeout(ms(50), Arc::new(scheduler.clone())).subscribe(ts.boxed());
    assert_eq!(source.requested(), 10);

    for (at, v) in [(40, 1), (80, 2), (120, 3)] {
      scheduler.advance_time_to(ms(at));
      source.next(v);
    }
    scheduler.advance_time_to(ms(169));
    assert!(!ts.is_terminated());

    scheduler.advance_time_to(ms(170));
    ts.assert_values(&[1, 2, 3]);
    ts.assert_error("no value received within 50ms");
    assert!(source.is_cancelled());

    source.next(4);
    source.complete();
    ts.assert_values(&[1, 2, 3]);
    assert_eq!(ts.completions(), 0);
  }

  #[rxflow_macro::test]
  fn silent_source_times_out_and_its_timer_is_released() {
    let scheduler = TestScheduler::new();
    let ts = TestSubscriber::<u64>::new(1);
    timer(ms(150), Arc::new(scheduler.clone()))
      .timeout(ms(100), Arc::new(scheduler.clone()))
      .subscribe(ts.boxed());
    assert_eq!(scheduler.pending_count(), 2);

    scheduler.advance_time_by(ms(100));
    assert!(matches!(ts.errors().as_slice(), [Error::Timeout(w)] if *w == ms(100)));
    assert_eq!(scheduler.pending_count(), 0);
  }

  #[rxflow_macro::test]
  fn fallback_inherits_outstanding_demand() {
    let scheduler = TestScheduler::new();
    let ts = TestSubscriber::new(1);
    never::<i64>()
      .timeout_or(ms(10), range(1, 5), Arc::new(scheduler.clone()))
      .subscribe(ts.boxed());

    scheduler.advance_time_by(ms(10));
    ts.assert_values(&[1]);
    ts.request(2);
    ts.assert_values(&[1, 2, 3]);
    ts.request(10);
    ts.assert_values(&[1, 2, 3, 4, 5]);
    ts.assert_complete();
  }

  #[rxflow_macro::test]
  fn fallback_is_not_timed() {
    let scheduler = TestScheduler::new();
    let fallback = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(5);
    never::<i32>()
      .timeout_or(ms(10), fallback.clone(), Arc::new(scheduler.clone()))
      .subscribe(ts.boxed());

    scheduler.advance_time_by(ms(10));
    assert_eq!(fallback.requested(), 5);
    scheduler.advance_time_by(ms(1000));
    fallback.next(7);
    fallback.complete();
    ts.assert_values(&[7]);
    ts.assert_complete();
  }

  #[rxflow_macro::test]
  fn source_error_cancels_the_timer() {
    let scheduler = TestScheduler::new();
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(1);
    source.clone().timeout(ms(10), Arc::new(scheduler.clone())).subscribe(ts.boxed());

    source.error(Error::msg("boom"));
    ts.assert_error("boom");
    assert_eq!(scheduler.pending_count(), 0);
    scheduler.advance_time_by(ms(10));
    assert_eq!(ts.errors().len(), 1);
  }

  #[rxflow_macro::test]
  fn downstream_cancel_releases_source_and_timer() {
    let scheduler = TestScheduler::new();
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(1);
    source.clone().timeout(ms(10), Arc::new(scheduler.clone())).subscribe(ts.boxed());

    ts.cancel();
    assert!(source.is_cancelled());
    assert_eq!(scheduler.pending_count(), 0);
  }

  #[rxflow_macro::test]
  fn unbounded_window_never_fires() {
    let scheduler = TestScheduler::new();
    let ts = TestSubscriber::<i32>::new(1);
    never().timeout(Duration::MAX, Arc::new(scheduler.clone())).subscribe(ts.boxed());

    scheduler.advance_time_by(Duration::from_secs(86_400));
    assert!(!ts.is_terminated());
    assert_eq!(scheduler.pending_count(), 1);
    ts.cancel();
    assert_eq!(scheduler.pending_count(), 0);
  }
}
