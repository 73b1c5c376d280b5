use std::{
  collections::VecDeque,
  marker::PhantomData,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;

use crate::{
  error::Error,
  hooks::{guard, guard_uncaught},
  observer::{BoxedSubscriber, Subscriber},
  publisher::Publisher,
  subscription::{add_cap, Subscription, SubscriptionRef, UNBOUNDED},
};

/// See [`PublisherExt::scan`](super::PublisherExt::scan).
///
/// The seed is owed to the downstream before anything was pulled from the
/// source, so the first unit of demand is kept back: a request for `n` asks
/// the source for `n - 1`, but never for less than one value, which leaves
/// room for at most one accumulated value waiting on demand.
pub struct Scan<P, T, R, F> {
  source: P,
  seed: R,
  accumulator: F,
  _marker: PhantomData<fn() -> T>,
}

impl<P, T, R, F> Scan<P, T, R, F> {
  pub(crate) fn new(source: P, seed: R, accumulator: F) -> Self {
    Scan { source, seed, accumulator, _marker: PhantomData }
  }
}

impl<P, T, R, F> Publisher<R> for Scan<P, T, R, F>
where
  P: Publisher<T>,
  T: Send + 'static,
  R: Clone + Send + Sync + 'static,
  F: FnMut(R, T) -> R + Clone + Send + Sync + 'static,
{
  fn subscribe(&self, mut subscriber: BoxedSubscriber<R>) {
    let inner = Arc::new(ScanInner {
      state: Mutex::new(ScanState::new(self.seed.clone())),
      // The subscribing thread owns the drain until attach has returned.
      wip: AtomicUsize::new(1),
      downstream: Mutex::new(None),
      acc: Mutex::new(Accumulator { value: Some(self.seed.clone()), f: self.accumulator.clone() }),
    });

    if let Err(err) = guard(|| subscriber.attach(inner.clone())) {
      inner.state.lock().done = true;
      guard_uncaught(|| subscriber.error(err));
      return;
    }
    *inner.downstream.lock() = Some(subscriber);
    inner.drain_loop(1);

    self.source.subscribe(Box::new(ScanSubscriber { inner, attached: false }));
  }
}

struct ScanInner<R, F> {
  state: Mutex<ScanState<R>>,
  wip: AtomicUsize,
  /// Locked by the drainer only, plus once while attaching.
  downstream: Mutex<Option<BoxedSubscriber<R>>>,
  acc: Mutex<Accumulator<R, F>>,
}

struct Accumulator<R, F> {
  /// `None` once the accumulator panicked.
  value: Option<R>,
  f: F,
}

struct ScanState<R> {
  seed: Option<R>,
  queue: VecDeque<R>,
  /// Downstream demand not delivered yet.
  requested: i64,
  /// Everything the downstream ever requested.
  total: i64,
  /// Everything asked from the source so far.
  forwarded: i64,
  upstream: Option<SubscriptionRef>,
  terminal: Option<Terminal>,
  invalid: Option<i64>,
  cancelled: bool,
  done: bool,
}

enum Terminal {
  Complete,
  Error(Error),
}

enum Signal<R> {
  Next(R),
  Complete,
  Error(Error),
}

impl<R> ScanState<R> {
  fn new(seed: R) -> Self {
    ScanState {
      seed: Some(seed),
      queue: VecDeque::new(),
      requested: 0,
      total: 0,
      forwarded: 0,
      upstream: None,
      terminal: None,
      invalid: None,
      cancelled: false,
      done: false,
    }
  }

  fn is_closed(&self) -> bool { self.done || self.cancelled }

  /// Demand to pass on to the source now. Updates the forwarded total.
  fn take_forward(&mut self) -> i64 {
    if self.upstream.is_none() || self.forwarded == UNBOUNDED || self.total == 0 {
      return 0;
    }
    let target = if self.total == UNBOUNDED { UNBOUNDED } else { (self.total - 1).max(1) };
    let delta = if target == UNBOUNDED { UNBOUNDED } else { target - self.forwarded };
    if delta <= 0 {
      return 0;
    }
    self.forwarded = target;
    delta
  }

  /// The next signal the downstream may receive, if any.
  fn poll(&mut self) -> Option<Signal<R>> {
    if let Some(n) = self.invalid.take() {
      self.done = true;
      return Some(Signal::Error(Error::InvalidRequest(n)));
    }
    if let Some(Terminal::Error(_)) = self.terminal {
      self.done = true;
      return match self.terminal.take() {
        Some(Terminal::Error(err)) => Some(Signal::Error(err)),
        _ => None,
      };
    }
    if self.requested > 0 {
      if let Some(value) = self.seed.take().or_else(|| self.queue.pop_front()) {
        if self.requested != UNBOUNDED {
          self.requested -= 1;
        }
        return Some(Signal::Next(value));
      }
    }
    if self.seed.is_none() && self.queue.is_empty() {
      if let Some(Terminal::Complete) = self.terminal {
        self.done = true;
        self.terminal = None;
        return Some(Signal::Complete);
      }
    }
    None
  }
}

impl<R: Send + 'static, F: Send + 'static> ScanInner<R, F> {
  fn drain(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      self.drain_loop(1);
    }
  }

  fn drain_loop(&self, mut missed: usize) {
    loop {
      let finished = {
        let mut slot = self.downstream.lock();
        let over = match slot.as_mut() {
          Some(downstream) => self.emit(downstream),
          None => false,
        };
        if over { slot.take() } else { None }
      };
      drop(finished);

      let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
      missed = prev - missed;
      if missed == 0 {
        break;
      }
    }
  }

  /// Delivers what is ready. Returns `true` once the downstream is done
  /// with.
  fn emit(&self, downstream: &mut BoxedSubscriber<R>) -> bool {
    loop {
      let (signal, upstream) = {
        let mut st = self.state.lock();
        if st.cancelled || st.done {
          return true;
        }
        let Some(signal) = st.poll() else {
          return false;
        };
        let upstream = if st.done { st.upstream.take() } else { None };
        (signal, upstream)
      };
      if let Some(upstream) = upstream {
        upstream.cancel();
      }

      match signal {
        Signal::Next(value) => {
          if let Err(err) = guard(|| downstream.next(value)) {
            let upstream = {
              let mut st = self.state.lock();
              st.done = true;
              st.queue.clear();
              st.upstream.take()
            };
            if let Some(upstream) = upstream {
              upstream.cancel();
            }
            guard_uncaught(|| downstream.error(err));
            return true;
          }
        }
        Signal::Complete => {
          guard_uncaught(|| downstream.complete());
          return true;
        }
        Signal::Error(err) => {
          guard_uncaught(|| downstream.error(err));
          return true;
        }
      }
    }
  }

  fn terminate(&self, terminal: Terminal) {
    {
      let mut st = self.state.lock();
      if st.is_closed() || st.terminal.is_some() {
        return;
      }
      if let Terminal::Error(_) = terminal {
        st.seed = None;
        st.queue.clear();
      }
      st.upstream = None;
      st.terminal = Some(terminal);
    }
    self.drain();
  }
}

impl<R: Send + 'static, F: Send + 'static> Subscription for ScanInner<R, F> {
  fn request(&self, n: i64) {
    let forward = {
      let mut st = self.state.lock();
      if st.is_closed() {
        return;
      }
      if n <= 0 {
        tracing::debug!(amount = n, "non-positive request");
        st.invalid.get_or_insert(n);
        None
      } else {
        st.requested = add_cap(st.requested, n);
        st.total = add_cap(st.total, n);
        let delta = st.take_forward();
        st.upstream.clone().filter(|_| delta > 0).map(|up| (up, delta))
      }
    };
    if let Some((upstream, delta)) = forward {
      upstream.request(delta);
    }
    self.drain();
  }

  fn cancel(&self) {
    let upstream = {
      let mut st = self.state.lock();
      if st.cancelled {
        return;
      }
      st.cancelled = true;
      st.seed = None;
      st.queue.clear();
      st.upstream.take()
    };
    if let Some(upstream) = upstream {
      upstream.cancel();
    }
    self.drain();
  }

  fn is_cancelled(&self) -> bool { self.state.lock().cancelled }
}

struct ScanSubscriber<R, F> {
  inner: Arc<ScanInner<R, F>>,
  attached: bool,
}

impl<T, R, F> Subscriber<T> for ScanSubscriber<R, F>
where
  T: Send + 'static,
  R: Clone + Send + 'static,
  F: FnMut(R, T) -> R + Send + 'static,
{
  fn attach(&mut self, subscription: SubscriptionRef) {
    let delta = {
      let mut st = self.inner.state.lock();
      if self.attached || st.is_closed() || st.terminal.is_some() {
        None
      } else {
        st.upstream = Some(subscription.clone());
        Some(st.take_forward())
      }
    };
    self.attached = true;
    match delta {
      None => subscription.cancel(),
      Some(delta) if delta > 0 => subscription.request(delta),
      Some(_) => {}
    }
  }

  fn next(&mut self, value: T) {
    if self.inner.state.lock().is_closed() {
      return;
    }
    let folded = {
      let mut acc = self.inner.acc.lock();
      let Some(current) = acc.value.take() else {
        return;
      };
      let f = &mut acc.f;
      match guard(|| f(current, value)) {
        Ok(next) => {
          acc.value = Some(next.clone());
          Ok(next)
        }
        Err(err) => Err(err),
      }
    };

    match folded {
      Ok(next) => {
        {
          let mut st = self.inner.state.lock();
          if st.is_closed() || st.terminal.is_some() {
            return;
          }
          st.queue.push_back(next);
        }
        self.inner.drain();
      }
      Err(err) => {
        tracing::debug!(error = %err, "accumulator panicked");
        let upstream = self.inner.state.lock().upstream.take();
        if let Some(upstream) = upstream {
          upstream.cancel();
        }
        self.inner.terminate(Terminal::Error(err));
      }
    }
  }

  fn error(&mut self, err: Error) { self.inner.terminate(Terminal::Error(err)); }

  fn complete(&mut self) { self.inner.terminate(Terminal::Complete); }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    ops::PublisherExt,
    publisher::{from_iter, range, throw},
    testing::{TestPublisher, TestSubscriber},
  };

  #[rxflow_macro::test]
  fn emits_seed_then_running_totals() {
    let ts = TestSubscriber::new(UNBOUNDED);
    range(1, 4).scan(0, |acc, v| acc + v).subscribe(ts.boxed());
    ts.assert_values(&[0, 1, 3, 6, 10]);
    ts.assert_complete();
  }

  #[rxflow_macro::test]
  fn empty_source_still_emits_the_seed() {
    let ts = TestSubscriber::new(1);
    from_iter(Vec::<i32>::new()).scan(7, |acc, v| acc + v).subscribe(ts.boxed());
    ts.assert_values(&[7]);
    ts.assert_complete();
  }

  #[rxflow_macro::test]
  fn seed_takes_the_first_unit_of_demand() {
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(0);
    source.clone().scan(0, |acc, v| acc + v).subscribe(ts.boxed());
    assert_eq!(source.requested(), 0);

    ts.request(3);
    ts.assert_values(&[0]);
    assert_eq!(source.requested(), 2);

    ts.request(2);
    assert_eq!(source.requested(), 4);
  }

  #[rxflow_macro::test]
  fn single_request_buffers_one_value_ahead() {
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(1);
    source.clone().scan(10, |acc, v| acc + v).subscribe(ts.boxed());
    ts.assert_values(&[10]);
    assert_eq!(source.requested(), 1);

    source.next(1);
    ts.assert_values(&[10]);

    ts.request(1);
    ts.assert_values(&[10, 11]);
    assert_eq!(source.requested(), 1);

    ts.request(1);
    assert_eq!(source.requested(), 2);
    source.next(2);
    ts.assert_values(&[10, 11, 13]);
  }

  #[rxflow_macro::test]
  fn completion_waits_for_buffered_values() {
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(1);
    source.clone().scan(0, |acc, v| acc + v).subscribe(ts.boxed());

    source.next(5);
    source.complete();
    assert!(!ts.is_terminated());

    ts.request(1);
    ts.assert_values(&[0, 5]);
    ts.assert_complete();
  }

  #[rxflow_macro::test]
  fn errors_skip_buffered_values() {
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(1);
    source.clone().scan(0, |acc, v| acc + v).subscribe(ts.boxed());

    source.next(5);
    source.error(Error::msg("broken"));
    ts.assert_values(&[0]);
    ts.assert_error("broken");
  }

  #[rxflow_macro::test]
  fn upstream_error_before_any_demand_drops_the_seed() {
    let ts = TestSubscriber::<i32>::new(0);
    throw::<i32>(Error::msg("nope")).scan(0, |acc, v| acc + v).subscribe(ts.boxed());
    ts.assert_values(&[]);
    ts.assert_error("nope");
  }

  #[rxflow_macro::test]
  fn panicking_accumulator_cancels_upstream() {
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(5);
    source
      .clone()
      .scan(0, |acc: i32, v: i32| if v == 2 { panic!("bad fold") } else { acc + v })
      .subscribe(ts.boxed());

    source.next(1);
    source.next(2);
    source.next(3);
    assert!(source.is_cancelled());
    ts.assert_values(&[0, 1]);
    assert!(matches!(ts.errors().as_slice(), [Error::Panicked(m)] if m == "bad fold"));
  }

  #[rxflow_macro::test]
  fn invalid_request_errors_once_and_cancels_upstream() {
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(2);
    source.clone().scan(0, |acc, v| acc + v).subscribe(ts.boxed());

    ts.request(0);
    ts.request(-5);
    source.next(1);
    assert!(source.is_cancelled());
    ts.assert_values(&[0]);
    assert!(matches!(ts.errors().as_slice(), [Error::InvalidRequest(0)]));
  }

  #[rxflow_macro::test]
  fn cancel_then_invalid_request_is_silent() {
    let source = TestPublisher::<i32>::new();
    let ts = TestSubscriber::new(0);
    source.clone().scan(0, |acc, v| acc + v).subscribe(ts.boxed());

    ts.cancel();
    ts.request(-1);
    assert!(source.is_cancelled());
    assert!(!ts.is_terminated());
  }

  #[rxflow_macro::test]
  fn every_subscription_starts_from_the_seed() {
    let scan = from_iter(vec![1, 2]).scan(0, |acc, v| acc + v);
    for _ in 0..2 {
      let ts = TestSubscriber::new(UNBOUNDED);
      scan.subscribe(ts.boxed());
      ts.assert_values(&[0, 1, 3]);
    }
  }
}
