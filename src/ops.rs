//! Operators built on the demand protocol, the arbiter and the schedulers.
//!
//! Every operator is reachable as a method of [`PublisherExt`], implemented
//! for all publishers. [`using`] builds a publisher rather than wrapping
//! one, so it is a plain function.

use std::sync::Arc;

use crate::{
  publisher::{timer, Publisher, PublisherRef, Timer},
  scheduler::{Duration, SchedulerRef},
};

pub mod delay;
pub mod delay_subscription;
pub mod scan;
pub mod timeout;
pub mod using;

pub use delay::{Delay, DelayWith};
pub use delay_subscription::DelaySubscription;
pub use scan::Scan;
pub use timeout::Timeout;
pub use using::{using, Using};

pub trait PublisherExt<T>: Publisher<T> + Sized {
  /// Emits `seed`, then every intermediate result of folding the source's
  /// values into it.
  ///
  /// The seed takes the first unit of demand. Completes when the source
  /// completes, after the seed; errors are forwarded right away.
  ///
  /// ```
  /// use rxflow::prelude::*;
  ///
  /// let ts = TestSubscriber::new(UNBOUNDED);
  /// from_iter(vec![1, 1, 1]).scan(100, |acc, v| acc + v).subscribe(ts.boxed());
  /// ts.assert_values(&[100, 101, 102, 103]);
  /// ts.assert_complete();
  /// ```
  fn scan<R, F>(self, seed: R, accumulator: F) -> Scan<Self, T, R, F>
  where
    F: FnMut(R, T) -> R,
  {
    Scan::new(self, seed, accumulator)
  }

  /// Fails with [`Error::Timeout`](crate::error::Error::Timeout) when
  /// `window` passes before the first value or between two values.
  fn timeout(self, window: Duration, scheduler: SchedulerRef) -> Timeout<Self, T> {
    Timeout::new(self, window, None, scheduler)
  }

  /// Like [`timeout`](Self::timeout), but switches to `fallback` instead of
  /// failing. Demand not yet satisfied by the source carries over.
  fn timeout_or<F>(self, window: Duration, fallback: F, scheduler: SchedulerRef) -> Timeout<Self, T>
  where
    F: Publisher<T> + 'static,
  {
    let fallback: PublisherRef<T> = Arc::new(fallback);
    Timeout::new(self, window, Some(fallback), scheduler)
  }

  /// Shifts every value and the completion by `delay` on `scheduler`.
  /// Errors are delivered right away, dropping values still waiting.
  fn delay(self, delay: Duration, scheduler: SchedulerRef) -> Delay<Self, T> {
    Delay::new(self, delay, scheduler)
  }

  /// Holds each value until the publisher `selector` builds for it emits
  /// or completes, so values may overtake each other. Completes once the
  /// source has completed and every held value was released. An error from
  /// the source or any delayer ends the stream.
  fn delay_with<F, D, U>(self, selector: F) -> DelayWith<Self, F, T, D, U>
  where
    F: Fn(&T) -> D + Send + Sync + 'static,
    D: Publisher<U>,
  {
    DelayWith::new(self, selector)
  }

  /// Subscribes to the source once `selector` emits its first value or
  /// completes. An error from `selector` is forwarded instead.
  fn delay_subscription<S, U>(self, selector: S) -> DelaySubscription<Self, S, T, U>
  where
    S: Publisher<U>,
  {
    DelaySubscription::new(self, selector)
  }

  /// Subscribes to the source after `delay` has passed on `scheduler`.
  fn delay_subscription_by(
    self, delay: Duration, scheduler: SchedulerRef,
  ) -> DelaySubscription<Self, Timer, T, u64> {
    DelaySubscription::new(self, timer(delay, scheduler))
  }
}

impl<T, P: Publisher<T>> PublisherExt<T> for P {}
