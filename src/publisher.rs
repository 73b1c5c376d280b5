//! Producers.
//!
//! A [`Publisher`] is a cold stream description: every call to `subscribe`
//! starts an independent run for that subscriber. Synchronous producers are
//! written as a pull-based [`Source`] and driven by a
//! [`DemandSubscription`], which turns consumer demand into `pull` calls.
//!
//! [`DemandSubscription`]: crate::subscription::DemandSubscription

use std::sync::Arc;

use crate::{error::Error, observer::BoxedSubscriber};

mod from_iter;
mod timer;
mod trivial;

pub use from_iter::{from_iter, from_source, range, FromIter, FromSource, Range};
pub use timer::{timer, Timer};
pub use trivial::{empty, never, throw, Empty, Never, Throw};

/// A stream that can be subscribed to any number of times.
pub trait Publisher<Item>: Send + Sync {
  /// Starts a run for `subscriber`. The subscriber is attached before any
  /// other signal and receives nothing it did not request.
  fn subscribe(&self, subscriber: BoxedSubscriber<Item>);
}

pub type PublisherRef<Item> = Arc<dyn Publisher<Item>>;

impl<Item, P: Publisher<Item> + ?Sized> Publisher<Item> for Arc<P> {
  #[inline]
  fn subscribe(&self, subscriber: BoxedSubscriber<Item>) { (**self).subscribe(subscriber) }
}

impl<Item, P: Publisher<Item> + ?Sized> Publisher<Item> for Box<P> {
  #[inline]
  fn subscribe(&self, subscriber: BoxedSubscriber<Item>) { (**self).subscribe(subscriber) }
}

/// A synchronous, pull-based producer.
///
/// `pull` is only called while the consumer has outstanding demand, and
/// never again after it returned `None` or an `Err`.
pub trait Source: Send + 'static {
  type Item: Send + 'static;

  /// The next value, `Some(Err(_))` to fail, or `None` when exhausted.
  fn pull(&mut self) -> Option<Result<Self::Item, Error>>;
}
