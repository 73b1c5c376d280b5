use std::sync::{
  atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering},
  Arc,
};

use parking_lot::Mutex;

use super::{add_demand, produced, Subscription, UNBOUNDED};
use crate::{
  error::Error,
  hooks::{guard, guard_uncaught},
  observer::BoxedSubscriber,
  publisher::Source,
};

const ACTIVE: u8 = 0;
const CANCELLED: u8 = 1;
const INVALID: u8 = 2;
const DONE: u8 = 3;

/// No invalid request recorded yet. Invalid amounts are always `<= 0`.
const NO_INVALID: i64 = 1;

/// Drives a [`Source`] under consumer demand.
///
/// `request`, `cancel` and the emission itself may be invoked from any
/// thread, including re-entrantly from inside `next`. A work-in-progress
/// counter elects a single drainer; every other caller only records its
/// intent and leaves, so signals to the subscriber are serialized and the
/// call stack does not grow with re-entrant requests.
///
/// # Invariants
///
/// - values delivered never exceed the sum of valid requests, unless that
///   sum reached [`UNBOUNDED`];
/// - at most one terminal signal is delivered, and nothing follows it;
/// - the first non-positive request ends the stream with exactly one
///   [`Error::InvalidRequest`];
/// - once cancellation is observed no further signal is delivered.
pub struct DemandSubscription<S: Source> {
  requested: AtomicI64,
  state: AtomicU8,
  invalid: AtomicI64,
  wip: AtomicUsize,
  emission: Mutex<Option<Emission<S>>>,
}

struct Emission<S: Source> {
  source: S,
  subscriber: BoxedSubscriber<S::Item>,
}

impl<S: Source> DemandSubscription<S> {
  /// Attaches `subscriber` and starts serving its requests from `source`.
  ///
  /// Requests made from within `attach` are honoured as soon as `attach`
  /// returns.
  pub fn subscribe(source: S, mut subscriber: BoxedSubscriber<S::Item>) -> Arc<Self> {
    let this = Arc::new(Self {
      requested: AtomicI64::new(0),
      state: AtomicU8::new(ACTIVE),
      invalid: AtomicI64::new(NO_INVALID),
      // The subscribing thread owns the drain until attach has returned.
      wip: AtomicUsize::new(1),
      emission: Mutex::new(None),
    });

    if let Err(err) = guard(|| subscriber.attach(this.clone())) {
      this.state.store(DONE, Ordering::Release);
      guard_uncaught(|| subscriber.error(err));
      return this;
    }

    *this.emission.lock() = Some(Emission { source, subscriber });
    this.drain_loop(1);
    this
  }

  /// Outstanding demand, [`UNBOUNDED`] once unbounded.
  pub fn requested(&self) -> i64 { self.requested.load(Ordering::Acquire) }

  fn drain(&self) {
    if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
      self.drain_loop(1);
    }
  }

  fn drain_loop(&self, mut missed: usize) {
    loop {
      let finished = {
        let mut slot = self.emission.lock();
        let over = match slot.as_mut() {
          Some(emission) => self.emit(emission),
          None => false,
        };
        if over { slot.take() } else { None }
      };
      // Dropped outside the lock: the subscriber may hold the last
      // reference to arbitrary resources.
      drop(finished);

      let prev = self.wip.fetch_sub(missed, Ordering::AcqRel);
      missed = prev - missed;
      if missed == 0 {
        break;
      }
    }
  }

  /// Emits as much as the current demand allows. Returns `true` once the
  /// run is over and the emission can be released.
  fn emit(&self, e: &mut Emission<S>) -> bool {
    loop {
      match self.state.load(Ordering::Acquire) {
        CANCELLED | DONE => return true,
        INVALID => {
          self.state.store(DONE, Ordering::Release);
          let n = self.invalid.load(Ordering::Acquire);
          tracing::debug!(amount = n, "non-positive request");
          guard_uncaught(|| e.subscriber.error(Error::InvalidRequest(n)));
          return true;
        }
        _ => {}
      }

      let requested = self.requested.load(Ordering::Acquire);
      if requested == 0 {
        return false;
      }

      let pulled = guard(|| e.source.pull());
      let value = match pulled {
        Ok(Some(Ok(value))) => value,
        Ok(None) => {
          self.state.store(DONE, Ordering::Release);
          guard_uncaught(|| e.subscriber.complete());
          return true;
        }
        Ok(Some(Err(err))) | Err(err) => {
          self.state.store(DONE, Ordering::Release);
          guard_uncaught(|| e.subscriber.error(err));
          return true;
        }
      };

      if let Err(err) = guard(|| e.subscriber.next(value)) {
        self.state.store(DONE, Ordering::Release);
        guard_uncaught(|| e.subscriber.error(err));
        return true;
      }
      if requested != UNBOUNDED {
        produced(&self.requested, 1);
      }
    }
  }
}

impl<S: Source> Subscription for DemandSubscription<S> {
  fn request(&self, n: i64) {
    if n <= 0 {
      // The recorded amount is published before the state that reveals it.
      let first = self
        .invalid
        .compare_exchange(NO_INVALID, n, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
      if first {
        let _ = self
          .state
          .compare_exchange(ACTIVE, INVALID, Ordering::AcqRel, Ordering::Acquire);
      }
    } else {
      add_demand(&self.requested, n);
    }
    self.drain();
  }

  fn cancel(&self) {
    let previous = self
      .state
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
        matches!(s, ACTIVE | INVALID).then_some(CANCELLED)
      });
    if previous.is_ok() {
      tracing::trace!("demand subscription cancelled");
      // The drainer releases the source and subscriber.
      self.drain();
    }
  }

  /// True once cancelled or terminated.
  fn is_cancelled(&self) -> bool {
    matches!(self.state.load(Ordering::Acquire), CANCELLED | DONE)
  }
}
