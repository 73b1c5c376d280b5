use std::{marker::PhantomData, sync::Arc};

use parking_lot::Mutex;

use super::Publisher;
use crate::{
  error::Error,
  hooks::{guard, guard_uncaught},
  observer::BoxedSubscriber,
  subscription::{EmptySubscription, Subscription, SubscriptionRef},
};

/// Attaches `subscription`, turning a panic into the subscriber's error.
/// Returns whether the subscriber can still receive signals.
fn attach<T>(subscriber: &mut BoxedSubscriber<T>, subscription: SubscriptionRef) -> bool {
  match guard(|| subscriber.attach(subscription)) {
    Ok(()) => true,
    Err(err) => {
      guard_uncaught(|| subscriber.error(err));
      false
    }
  }
}

/// Completes right after attaching, without waiting for demand.
pub struct Empty<T>(PhantomData<fn() -> T>);

pub fn empty<T>() -> Empty<T> { Empty(PhantomData) }

impl<T> Publisher<T> for Empty<T> {
  fn subscribe(&self, mut subscriber: BoxedSubscriber<T>) {
    if attach(&mut subscriber, EmptySubscription::new()) {
      guard_uncaught(|| subscriber.complete());
    }
  }
}

/// Attaches and then stays silent forever, apart from rejecting a
/// non-positive request with [`Error::InvalidRequest`].
pub struct Never<T>(PhantomData<fn() -> T>);

pub fn never<T>() -> Never<T> { Never(PhantomData) }

impl<T: Send + 'static> Publisher<T> for Never<T> {
  fn subscribe(&self, mut subscriber: BoxedSubscriber<T>) {
    let sub = Arc::new(NeverSubscription { state: Mutex::new(NeverState::default()) });
    if !attach(&mut subscriber, sub.clone()) {
      sub.state.lock().finished = true;
      return;
    }
    sub.state.lock().subscriber = Some(subscriber);
    sub.settle();
  }
}

struct NeverSubscription<T> {
  state: Mutex<NeverState<T>>,
}

struct NeverState<T> {
  subscriber: Option<BoxedSubscriber<T>>,
  invalid: Option<i64>,
  finished: bool,
}

impl<T> Default for NeverState<T> {
  fn default() -> Self { Self { subscriber: None, invalid: None, finished: false } }
}

impl<T> NeverSubscription<T> {
  /// Delivers a recorded invalid request, or releases the subscriber once
  /// cancelled.
  fn settle(&self) {
    let (invalid, subscriber) = {
      let mut st = self.state.lock();
      match (st.finished, st.invalid) {
        (true, _) => (None, st.subscriber.take()),
        (false, Some(n)) => {
          let Some(subscriber) = st.subscriber.take() else {
            // Still attaching; the subscribing thread settles afterwards.
            return;
          };
          st.finished = true;
          (Some(n), Some(subscriber))
        }
        (false, None) => return,
      }
    };
    if let (Some(n), Some(mut subscriber)) = (invalid, subscriber) {
      tracing::debug!(amount = n, "non-positive request");
      guard_uncaught(|| subscriber.error(Error::InvalidRequest(n)));
    }
  }
}

impl<T: Send> Subscription for NeverSubscription<T> {
  fn request(&self, n: i64) {
    if n > 0 {
      return;
    }
    self.state.lock().invalid.get_or_insert(n);
    self.settle();
  }

  fn cancel(&self) {
    self.state.lock().finished = true;
    self.settle();
  }

  fn is_cancelled(&self) -> bool { self.state.lock().finished }
}

/// Fails with a clone of `err` right after attaching.
pub struct Throw<T> {
  err: Error,
  _item: PhantomData<fn() -> T>,
}

pub fn throw<T>(err: Error) -> Throw<T> { Throw { err, _item: PhantomData } }

impl<T> Publisher<T> for Throw<T> {
  fn subscribe(&self, mut subscriber: BoxedSubscriber<T>) {
    if attach(&mut subscriber, EmptySubscription::new()) {
      guard_uncaught(|| subscriber.error(self.err.clone()));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{observer::Subscriber, testing::TestSubscriber};

  #[rxflow_macro::test]
  fn empty_completes_without_request() {
    let ts = TestSubscriber::<u8>::new(0);
    empty().subscribe(ts.boxed());
    ts.assert_complete();
    ts.assert_values(&[]);
  }

  #[rxflow_macro::test]
  fn never_stays_silent() {
    let ts = TestSubscriber::<u8>::new(5);
    never().subscribe(ts.boxed());
    assert!(!ts.is_terminated());
  }

  #[rxflow_macro::test]
  fn never_rejects_a_non_positive_request_once() {
    let ts = TestSubscriber::<u8>::new(3);
    never().subscribe(ts.boxed());
    ts.request(0);
    ts.request(-1);
    ts.request(2);

    assert_eq!(ts.errors().len(), 1);
    assert!(matches!(ts.errors()[0], Error::InvalidRequest(0)));
    ts.assert_values(&[]);
  }

  #[rxflow_macro::test]
  fn never_after_cancel_is_silent() {
    let ts = TestSubscriber::<u8>::new(1);
    never().subscribe(ts.boxed());
    ts.cancel();
    ts.request(-1);
    assert!(!ts.is_terminated());
  }

  #[rxflow_macro::test]
  fn throw_delivers_error() {
    let ts = TestSubscriber::<u8>::new(0);
    throw(Error::msg("nope")).subscribe(ts.boxed());
    ts.assert_error("nope");
  }

  /// Requests the given amount on attach, or panics there when it is
  /// `None`. Records the labels of what it receives afterwards.
  struct Scripted(Option<i64>, Arc<Mutex<Vec<&'static str>>>);

  impl Subscriber<u8> for Scripted {
    fn attach(&mut self, subscription: SubscriptionRef) {
      match self.0 {
        Some(n) => subscription.request(n),
        None => panic!("attach failed"),
      }
    }

    fn next(&mut self, _value: u8) { self.1.lock().push("next") }

    fn error(&mut self, err: Error) { self.1.lock().push(err.as_label()) }

    fn complete(&mut self) { self.1.lock().push("complete") }
  }

  #[rxflow_macro::test]
  fn never_rejects_an_invalid_request_made_while_attaching() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    never::<u8>().subscribe(Box::new(Scripted(Some(-2), seen.clone())));
    assert_eq!(*seen.lock(), vec!["invalid_request"]);
  }

  #[rxflow_macro::test]
  fn attach_panic_becomes_the_only_signal() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    empty::<u8>().subscribe(Box::new(Scripted(None, seen.clone())));
    throw::<u8>(Error::msg("lost")).subscribe(Box::new(Scripted(None, seen.clone())));
    never::<u8>().subscribe(Box::new(Scripted(None, seen.clone())));
    assert_eq!(*seen.lock(), vec!["callback_panicked"; 3]);
  }
}
