//! The demand handle between a producer and its consumer.
//!
//! A consumer receives one [`Subscription`] through `Subscriber::attach` and
//! uses it to ask for more values (`request`) or to stop the flow (`cancel`).
//! Demand is additive and saturates at [`UNBOUNDED`], after which the
//! producer stops accounting and emits freely.

use std::sync::{
  atomic::{AtomicBool, AtomicI64, Ordering},
  Arc,
};

use crate::disposable::{self, DisposableRef};

mod arbiter;
mod demand;

pub use arbiter::{ArbiterSubscriber, SubscriptionArbiter};
pub use demand::DemandSubscription;

/// Demand sentinel meaning "no limit". Once reached it is never decremented.
pub const UNBOUNDED: i64 = i64::MAX;

/// Demand and cancellation handle handed to a subscriber.
pub trait Subscription: Send + Sync {
  /// Asks for `n` more values.
  ///
  /// A non-positive `n` is a protocol violation: the stream terminates with
  /// exactly one `Error::InvalidRequest`, once, and nothing else is emitted.
  fn request(&self, n: i64);

  /// Stops the flow. Idempotent; signals may still arrive while the
  /// cancellation propagates but none after it has been observed.
  fn cancel(&self);

  fn is_cancelled(&self) -> bool;
}

pub type SubscriptionRef = Arc<dyn Subscription>;

impl<T: Subscription + ?Sized> Subscription for Arc<T> {
  #[inline]
  fn request(&self, n: i64) { (**self).request(n) }

  #[inline]
  fn cancel(&self) { (**self).cancel() }

  #[inline]
  fn is_cancelled(&self) -> bool { (**self).is_cancelled() }
}

// ==================== Demand arithmetic ====================

/// `a + b`, saturating at [`UNBOUNDED`].
#[inline]
pub fn add_cap(a: i64, b: i64) -> i64 { a.saturating_add(b) }

/// Adds `n` to `requested` and returns the previous value. Unbounded demand
/// stays unbounded.
pub fn add_demand(requested: &AtomicI64, n: i64) -> i64 {
  match requested.fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
    (r != UNBOUNDED).then(|| add_cap(r, n))
  }) {
    Ok(prev) | Err(prev) => prev,
  }
}

/// Subtracts `n` delivered values from `requested` and returns what is left.
/// Unbounded demand is left untouched.
pub fn produced(requested: &AtomicI64, n: i64) -> i64 {
  match requested.fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
    (r != UNBOUNDED).then(|| (r - n).max(0))
  }) {
    Ok(prev) => (prev - n).max(0),
    Err(prev) => prev,
  }
}

// ==================== Trivial subscriptions ====================

/// A subscription that ignores demand and only records cancellation. Handed
/// to subscribers of sources that are done before anything could be asked.
#[derive(Debug, Default)]
pub struct EmptySubscription {
  cancelled: AtomicBool,
}

impl EmptySubscription {
  pub fn new() -> Arc<Self> { Arc::new(Self::default()) }
}

impl Subscription for EmptySubscription {
  fn request(&self, _n: i64) {}

  fn cancel(&self) { self.cancelled.store(true, Ordering::Release); }

  fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Acquire) }
}

/// A disposable that cancels `sub` when disposed, so upstream subscriptions
/// can live in the same containers as timers and tasks.
pub fn cancel_on_dispose(sub: SubscriptionRef) -> DisposableRef {
  disposable::from_fn(move || sub.cancel())
}

#[cfg(test)]
mod tests {
  use std::{sync::atomic::AtomicI64, thread};

  use super::*;
  use crate::disposable::Disposable;

  #[rxflow_macro::test]
  fn add_demand_saturates_and_sticks() {
    let requested = AtomicI64::new(0);
    assert_eq!(add_demand(&requested, 5), 0);
    assert_eq!(add_demand(&requested, UNBOUNDED - 2), 5);
    assert_eq!(requested.load(Ordering::SeqCst), UNBOUNDED);

    assert_eq!(add_demand(&requested, 1), UNBOUNDED);
    assert_eq!(produced(&requested, 10), UNBOUNDED);
    assert_eq!(requested.load(Ordering::SeqCst), UNBOUNDED);
  }

  #[rxflow_macro::test]
  fn produced_never_goes_negative() {
    let requested = AtomicI64::new(3);
    assert_eq!(produced(&requested, 2), 1);
    assert_eq!(produced(&requested, 5), 0);
    assert_eq!(requested.load(Ordering::SeqCst), 0);
  }

  #[rxflow_macro::test]
  fn concurrent_requests_are_summed() {
    let requested = Arc::new(AtomicI64::new(0));
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let requested = requested.clone();
        thread::spawn(move || {
          for _ in 0..1000 {
            add_demand(&requested, 3);
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(requested.load(Ordering::SeqCst), 8 * 1000 * 3);
  }

  #[rxflow_macro::test]
  fn cancel_on_dispose_cancels_once_disposed() {
    let sub = EmptySubscription::new();
    let d = cancel_on_dispose(sub.clone());
    assert!(!sub.is_cancelled());
    d.dispose();
    assert!(sub.is_cancelled());
  }
}
