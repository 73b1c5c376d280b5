use std::{
  marker::PhantomData,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;

use crate::{
  disposable::Disposable,
  error::Error,
  hooks::{guard, report_uncaught},
  observer::{BoxedSubscriber, Subscriber},
  publisher::Publisher,
  subscription::{SubscriptionArbiter, SubscriptionRef},
};

/// A publisher whose every run owns a resource, created on subscribe and
/// released exactly once when the run ends or is cancelled.
///
/// Built by [`using`]. By default the resource is released after the
/// terminal signal has been handed on; [`release_eagerly`] releases it
/// before.
///
/// [`release_eagerly`]: Using::release_eagerly
pub struct Using<T, R, P, FR, FP, FD> {
  acquire: FR,
  make: FP,
  release: Arc<FD>,
  eager: bool,
  _marker: PhantomData<fn() -> (T, R, P)>,
}

/// Creates a resource with `acquire` for each subscriber, streams the
/// publisher `make` builds from it, and hands the resource to `release`
/// once the stream is over.
///
/// A failing `acquire` ends the run with its error; a failing or panicking
/// `make` releases the resource before the error is delivered. A panic in
/// `release` is reported to the uncaught-error hook.
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use rxflow::{ops::using, prelude::*};
///
/// let closed = Arc::new(Mutex::new(false));
/// let flag = closed.clone();
/// let words = using(
///   || Ok("hello resource world".to_owned()),
///   |text: &String| from_iter(text.split(' ').map(str::to_owned).collect::<Vec<_>>()),
///   move |_text| *flag.lock().unwrap() = true,
/// );
///
/// let ts = TestSubscriber::new(UNBOUNDED);
/// words.subscribe(ts.boxed());
/// ts.assert_values(&["hello".to_owned(), "resource".to_owned(), "world".to_owned()]);
/// ts.assert_complete();
/// assert!(*closed.lock().unwrap());
/// ```
pub fn using<T, R, P, FR, FP, FD>(
  acquire: FR, make: FP, release: FD,
) -> Using<T, R, P, FR, FP, FD>
where
  FR: Fn() -> Result<R, Error>,
  FP: Fn(&R) -> P,
  FD: Fn(R),
  P: Publisher<T>,
{
  Using { acquire, make, release: Arc::new(release), eager: false, _marker: PhantomData }
}

impl<T, R, P, FR, FP, FD> Using<T, R, P, FR, FP, FD> {
  /// Releases the resource before the terminal signal is delivered.
  pub fn release_eagerly(mut self) -> Self {
    self.eager = true;
    self
  }
}

impl<T, R, P, FR, FP, FD> Publisher<T> for Using<T, R, P, FR, FP, FD>
where
  FR: Fn() -> Result<R, Error> + Send + Sync,
  FP: Fn(&R) -> P + Send + Sync,
  FD: Fn(R) + Send + Sync + 'static,
  P: Publisher<T>,
  R: Send + 'static,
  T: Send + 'static,
{
  fn subscribe(&self, subscriber: BoxedSubscriber<T>) {
    let arbiter = SubscriptionArbiter::attach(subscriber);
    let resource = match guard(&self.acquire) {
      Ok(Ok(resource)) => resource,
      Ok(Err(err)) | Err(err) => {
        tracing::debug!(error = %err, "resource acquisition failed");
        arbiter.fail(err);
        return;
      }
    };

    let made = guard(|| (self.make)(&resource));
    let lease = Arc::new(Lease {
      resource: Mutex::new(Some(resource)),
      release: self.release.clone(),
      deferred: AtomicBool::new(false),
    });
    // Cancellation and failures release through the arbiter's resources.
    if !arbiter.resources().add(lease.clone()) {
      return;
    }
    let publisher = match made {
      Ok(publisher) => publisher,
      Err(err) => {
        arbiter.fail(err);
        return;
      }
    };

    let upstream =
      LeaseSubscriber { arbiter: arbiter.clone(), lease, eager: self.eager, generation: None };
    if let Err(err) = guard(|| publisher.subscribe(Box::new(upstream))) {
      arbiter.fail(err);
    }
  }
}

/// The resource of one run.
struct Lease<R, FD> {
  resource: Mutex<Option<R>>,
  release: Arc<FD>,
  /// Set while a terminal signal is handed on ahead of the release.
  deferred: AtomicBool,
}

impl<R, FD: Fn(R)> Lease<R, FD> {
  fn release_now(&self) {
    let resource = self.resource.lock().take();
    if let Some(resource) = resource {
      if let Err(err) = guard(|| (self.release)(resource)) {
        report_uncaught(err);
      }
    }
  }
}

impl<R: Send, FD: Fn(R) + Send + Sync> Disposable for Lease<R, FD> {
  fn dispose(&self) {
    if !self.deferred.load(Ordering::Acquire) {
      self.release_now();
    }
  }

  fn is_disposed(&self) -> bool { self.resource.lock().is_none() }
}

struct LeaseSubscriber<T, R, FD> {
  arbiter: Arc<SubscriptionArbiter<T>>,
  lease: Arc<Lease<R, FD>>,
  eager: bool,
  generation: Option<u64>,
}

impl<T, R, FD> LeaseSubscriber<T, R, FD>
where
  T: Send + 'static,
  R: Send,
  FD: Fn(R) + Send + Sync,
{
  fn finish(&self, signal: impl FnOnce(&SubscriptionArbiter<T>, u64)) {
    let Some(generation) = self.generation else {
      return;
    };
    if self.eager {
      self.lease.release_now();
      signal(&self.arbiter, generation);
    } else {
      self.lease.deferred.store(true, Ordering::Release);
      signal(&self.arbiter, generation);
      self.lease.release_now();
    }
  }
}

impl<T, R, FD> Subscriber<T> for LeaseSubscriber<T, R, FD>
where
  T: Send + 'static,
  R: Send,
  FD: Fn(R) + Send + Sync,
{
  fn attach(&mut self, subscription: SubscriptionRef) {
    if self.generation.is_some() {
      subscription.cancel();
      return;
    }
    self.generation = self.arbiter.set_subscription(subscription);
  }

  fn next(&mut self, value: T) {
    if let Some(generation) = self.generation {
      self.arbiter.next(generation, value);
    }
  }

  fn error(&mut self, err: Error) {
    self.finish(|arbiter, generation| arbiter.error(generation, err));
  }

  fn complete(&mut self) { self.finish(|arbiter, generation| arbiter.complete(generation)); }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use super::*;
  use crate::{
    observer::FnSubscriber,
    publisher::{from_iter, never, throw, timer, Throw},
    scheduler::{Duration, TestScheduler},
    subscription::UNBOUNDED,
    testing::{TestPublisher, TestSubscriber},
  };

  type Log = Arc<Mutex<Vec<String>>>;

  fn push(log: &Log, event: impl Into<String>) { log.lock().push(event.into()) }

  /// A run over the words of a sentence, logging when the resource is
  /// opened and closed.
  fn sentence(log: &Log, eager: bool) -> impl Publisher<String> {
    let (opened, closed) = (log.clone(), log.clone());
    let words = using(
      move || {
        push(&opened, "opened");
        Ok("Hello world!".to_owned())
      },
      |text: &String| from_iter(text.split(' ').map(str::to_owned).collect::<Vec<_>>()),
      move |_text| push(&closed, "disposed"),
    );
    if eager {
      words.release_eagerly()
    } else {
      words
    }
  }

  /// Logs the terminal signal it receives.
  fn logging(log: &Log) -> BoxedSubscriber<String> {
    let (on_next, on_complete) = (log.clone(), log.clone());
    Box::new(
      FnSubscriber::new(move |word: String| push(&on_next, word))
        .on_complete(move || push(&on_complete, "completed")),
    )
  }

  #[rxflow_macro::test]
  fn releases_after_completion_by_default() {
    let log = Log::default();
    sentence(&log, false).subscribe(logging(&log));
    assert_eq!(*log.lock(), vec!["opened", "Hello", "world!", "completed", "disposed"]);
  }

  #[rxflow_macro::test]
  fn eager_release_comes_before_completion() {
    let log = Log::default();
    sentence(&log, true).subscribe(logging(&log));
    assert_eq!(*log.lock(), vec!["opened", "Hello", "world!", "disposed", "completed"]);
  }

  #[rxflow_macro::test]
  fn every_subscriber_gets_its_own_resource() {
    let log = Log::default();
    let words = sentence(&log, false);
    words.subscribe(logging(&log));
    words.subscribe(logging(&log));
    let log = log.lock();
    assert_eq!(log.iter().filter(|e| *e == "opened").count(), 2);
    assert_eq!(log.iter().filter(|e| *e == "disposed").count(), 2);
  }

  #[rxflow_macro::test]
  fn failed_acquire_ends_the_run() {
    let made = Arc::new(AtomicUsize::new(0));
    let m = made.clone();
    let ts = TestSubscriber::<i32>::new(1);
    using(
      || Err::<(), _>(Error::msg("no resource")),
      move |_: &()| {
        m.fetch_add(1, Ordering::SeqCst);
        never::<i32>()
      },
      |_| {},
    )
    .subscribe(ts.boxed());

    ts.assert_error("no resource");
    assert_eq!(made.load(Ordering::SeqCst), 0);
  }

  #[rxflow_macro::test]
  fn failed_factory_still_releases() {
    let released = Arc::new(AtomicUsize::new(0));
    let r = released.clone();
    let ts = TestSubscriber::<i32>::new(1);
    using(
      || Ok(7),
      |_: &i32| -> Throw<i32> { panic!("factory failed") },
      move |_| {
        r.fetch_add(1, Ordering::SeqCst);
      },
    )
    .subscribe(ts.boxed());

    assert!(matches!(ts.errors().as_slice(), [Error::Panicked(_)]));
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[rxflow_macro::test]
  fn source_error_releases_once() {
    let released = Arc::new(AtomicUsize::new(0));
    let r = released.clone();
    let ts = TestSubscriber::<i32>::new(1);
    using(
      || Ok(()),
      |_: &()| throw::<i32>(Error::msg("broken pipe")),
      move |_| {
        r.fetch_add(1, Ordering::SeqCst);
      },
    )
    .subscribe(ts.boxed());

    ts.assert_error("broken pipe");
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[rxflow_macro::test]
  fn cancel_releases_and_stops_the_inner_stream() {
    let inner = TestPublisher::<i32>::new();
    let released = Arc::new(AtomicUsize::new(0));
    let (i, r) = (inner.clone(), released.clone());
    let ts = TestSubscriber::new(UNBOUNDED);
    using(
      || Ok(()),
      move |_: &()| i.clone(),
      move |_| {
        r.fetch_add(1, Ordering::SeqCst);
      },
    )
    .subscribe(ts.boxed());

    inner.next(1);
    ts.cancel();
    assert!(inner.is_cancelled());
    assert_eq!(released.load(Ordering::SeqCst), 1);
    ts.cancel();
    assert_eq!(released.load(Ordering::SeqCst), 1);
    ts.assert_values(&[1]);
  }

  #[rxflow_macro::test]
  fn timed_inner_stream_holds_the_resource_until_it_fires() {
    let scheduler = TestScheduler::new();
    let released = Arc::new(AtomicUsize::new(0));
    let r = released.clone();
    let s = scheduler.clone();
    let ts = TestSubscriber::new(1);
    using(
      || Ok(()),
      move |_: &()| timer(Duration::from_millis(100), Arc::new(s.clone())),
      move |_| {
        r.fetch_add(1, Ordering::SeqCst);
      },
    )
    .subscribe(ts.boxed());

    scheduler.advance_time_by(Duration::from_millis(99));
    assert_eq!(released.load(Ordering::SeqCst), 0);
    scheduler.advance_time_by(Duration::from_millis(1));
    ts.assert_values(&[0]);
    ts.assert_complete();
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }
}
