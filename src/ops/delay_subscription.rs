use std::{marker::PhantomData, sync::Arc};

use crate::{
  disposable::DisposableRef,
  error::Error,
  observer::{BoxedSubscriber, Subscriber},
  publisher::Publisher,
  subscription::{cancel_on_dispose, SubscriptionArbiter, SubscriptionRef, UNBOUNDED},
};

/// See [`PublisherExt::delay_subscription`](super::PublisherExt::delay_subscription).
pub struct DelaySubscription<P, S, T, U> {
  source: Arc<P>,
  selector: S,
  _marker: PhantomData<fn() -> (T, U)>,
}

impl<P, S, T, U> DelaySubscription<P, S, T, U> {
  pub(crate) fn new(source: P, selector: S) -> Self {
    DelaySubscription { source: Arc::new(source), selector, _marker: PhantomData }
  }
}

impl<P, S, T, U> Publisher<T> for DelaySubscription<P, S, T, U>
where
  P: Publisher<T> + 'static,
  S: Publisher<U>,
  T: Send + 'static,
  U: Send + 'static,
{
  fn subscribe(&self, subscriber: BoxedSubscriber<T>) {
    let arbiter = SubscriptionArbiter::attach(subscriber);
    self.selector.subscribe(Box::new(Trigger {
      arbiter,
      source: self.source.clone(),
      registration: None,
      fired: false,
    }));
  }
}

/// Subscribed to the selector; opens the source on its first signal.
struct Trigger<P, T> {
  arbiter: Arc<SubscriptionArbiter<T>>,
  source: Arc<P>,
  /// The selector's subscription as held by the arbiter's resources.
  registration: Option<DisposableRef>,
  fired: bool,
}

impl<P, T> Trigger<P, T>
where
  P: Publisher<T>,
  T: Send + 'static,
{
  /// Releases the selector. Returns `false` when already fired.
  fn fire(&mut self) -> bool {
    if std::mem::replace(&mut self.fired, true) {
      return false;
    }
    if let Some(registration) = self.registration.take() {
      self.arbiter.resources().delete(&registration);
    }
    true
  }

  fn open(&mut self) {
    if self.fire() && !self.arbiter.is_terminated() {
      tracing::trace!("selector fired, subscribing to source");
      self.source.subscribe(Box::new(self.arbiter.upstream()));
    }
  }
}

impl<P, T, U> Subscriber<U> for Trigger<P, T>
where
  P: Publisher<T>,
  T: Send + 'static,
{
  fn attach(&mut self, subscription: SubscriptionRef) {
    if self.fired || self.registration.is_some() {
      subscription.cancel();
      return;
    }
    let registration = cancel_on_dispose(subscription.clone());
    if !self.arbiter.resources().add(registration.clone()) {
      return;
    }
    self.registration = Some(registration);
    subscription.request(UNBOUNDED);
  }

  fn next(&mut self, _value: U) { self.open(); }

  fn error(&mut self, err: Error) {
    if self.fire() {
      self.arbiter.fail(err);
    }
  }

  fn complete(&mut self) { self.open(); }
}
