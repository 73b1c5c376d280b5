//! Subscriber trait and implementations
//!
//! A [`Subscriber`] is the consumer end of a stream. It is attached exactly
//! once, then receives any number of `next` signals followed by at most one
//! terminal signal (`error` or `complete`). A subscriber only receives as
//! many values as it requested through the [`Subscription`] passed to
//! `attach`.

use crate::{
  error::Error,
  hooks::{guard, report_uncaught},
  subscription::{Subscription, SubscriptionRef, UNBOUNDED},
};

// ============================================================================
// Subscriber Trait
// ============================================================================

/// The consumer of a stream.
///
/// Signals to one subscriber are serialized: no two of these methods run
/// concurrently for the same subscriber.
pub trait Subscriber<Item>: Send {
  /// Called once, before any other signal, with the handle used to request
  /// values and cancel.
  fn attach(&mut self, subscription: SubscriptionRef);

  /// Delivers one requested value.
  fn next(&mut self, value: Item);

  /// Terminal failure. Nothing follows it.
  fn error(&mut self, err: Error);

  /// Terminal success. Nothing follows it.
  fn complete(&mut self);
}

pub type BoxedSubscriber<Item> = Box<dyn Subscriber<Item>>;

impl<Item, S: Subscriber<Item> + ?Sized> Subscriber<Item> for Box<S> {
  #[inline]
  fn attach(&mut self, subscription: SubscriptionRef) { (**self).attach(subscription) }

  #[inline]
  fn next(&mut self, value: Item) { (**self).next(value) }

  #[inline]
  fn error(&mut self, err: Error) { (**self).error(err) }

  #[inline]
  fn complete(&mut self) { (**self).complete() }
}

// ============================================================================
// FnSubscriber
// ============================================================================

type ErrorFn = Box<dyn FnMut(Error) + Send>;
type CompleteFn = Box<dyn FnMut() + Send>;

/// A subscriber built from closures that requests [`UNBOUNDED`] on attach.
///
/// Errors without an `on_error` handler go to the uncaught hook. A panic in
/// the `next` closure cancels the upstream and is treated as an error.
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use rxflow::prelude::*;
///
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let s = seen.clone();
/// range(1, 3).subscribe(Box::new(FnSubscriber::new(move |v: i64| s.lock().unwrap().push(v))));
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
/// ```
pub struct FnSubscriber<N> {
  on_next: N,
  on_error: Option<ErrorFn>,
  on_complete: Option<CompleteFn>,
  subscription: Option<SubscriptionRef>,
  done: bool,
}

impl<N> FnSubscriber<N> {
  pub fn new(on_next: N) -> Self {
    Self {
      on_next,
      on_error: None,
      on_complete: None,
      subscription: None,
      done: false,
    }
  }

  pub fn on_error(mut self, f: impl FnMut(Error) + Send + 'static) -> Self {
    self.on_error = Some(Box::new(f));
    self
  }

  pub fn on_complete(mut self, f: impl FnMut() + Send + 'static) -> Self {
    self.on_complete = Some(Box::new(f));
    self
  }

  fn fail(&mut self, err: Error) {
    self.done = true;
    match self.on_error.as_mut() {
      Some(f) => {
        if let Err(panic) = guard(|| f(err)) {
          report_uncaught(panic);
        }
      }
      None => report_uncaught(err),
    }
  }
}

impl<Item, N> Subscriber<Item> for FnSubscriber<N>
where
  N: FnMut(Item) + Send,
{
  fn attach(&mut self, subscription: SubscriptionRef) {
    if self.subscription.is_some() || self.done {
      subscription.cancel();
      return;
    }
    self.subscription = Some(subscription.clone());
    subscription.request(UNBOUNDED);
  }

  fn next(&mut self, value: Item) {
    if self.done {
      return;
    }
    let on_next = &mut self.on_next;
    if let Err(err) = guard(|| on_next(value)) {
      if let Some(sub) = self.subscription.take() {
        sub.cancel();
      }
      self.fail(err);
    }
  }

  fn error(&mut self, err: Error) {
    if self.done {
      report_uncaught(err);
      return;
    }
    self.subscription = None;
    self.fail(err);
  }

  fn complete(&mut self) {
    if self.done {
      return;
    }
    self.done = true;
    self.subscription = None;
    if let Some(f) = self.on_complete.as_mut() {
      if let Err(panic) = guard(f) {
        report_uncaught(panic);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
  };

  use super::*;
  use crate::subscription::EmptySubscription;

  #[derive(Default)]
  struct Spy {
    requested: AtomicUsize,
    last: Mutex<i64>,
    cancelled: AtomicBool,
  }

  impl Subscription for Spy {
    fn request(&self, n: i64) {
      self.requested.fetch_add(1, Ordering::SeqCst);
      *self.last.lock().unwrap() = n;
    }

    fn cancel(&self) { self.cancelled.store(true, Ordering::SeqCst); }

    fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::SeqCst) }
  }

  #[rxflow_macro::test]
  fn requests_unbounded_on_attach() {
    let spy = Arc::new(Spy::default());
    let mut s = FnSubscriber::new(|_: i32| {});
    s.attach(spy.clone());
    assert_eq!(spy.requested.load(Ordering::SeqCst), 1);
    assert_eq!(*spy.last.lock().unwrap(), UNBOUNDED);
  }

  #[rxflow_macro::test]
  fn second_attach_is_cancelled() {
    let mut s = FnSubscriber::new(|_: i32| {});
    s.attach(EmptySubscription::new());
    let late = EmptySubscription::new();
    s.attach(late.clone());
    assert!(late.is_cancelled());
  }

  #[rxflow_macro::test]
  fn panicking_next_cancels_and_reports() {
    let spy = Arc::new(Spy::default());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let mut s = FnSubscriber::new(|v: i32| {
      if v == 2 {
        panic!("bad value");
      }
    })
    .on_error(move |err| e.lock().unwrap().push(err.as_label()));

    s.attach(spy.clone());
    s.next(1);
    s.next(2);
    s.next(3);

    assert!(spy.is_cancelled());
    assert_eq!(*errors.lock().unwrap(), vec!["callback_panicked"]);
  }

  #[rxflow_macro::test]
  fn complete_runs_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let mut s = FnSubscriber::new(|_: i32| {}).on_complete(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    s.attach(EmptySubscription::new());
    s.complete();
    s.complete();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }
}
