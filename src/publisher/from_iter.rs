use super::{Publisher, Source};
use crate::{error::Error, observer::BoxedSubscriber, subscription::DemandSubscription};

/// Emits the items of an iterable, one per requested value, then completes.
///
/// The iterable is cloned for every subscription so each subscriber sees the
/// full sequence.
#[derive(Clone)]
pub struct FromIter<I> {
  iter: I,
}

pub fn from_iter<I>(iter: I) -> FromIter<I>
where
  I: IntoIterator + Clone,
{
  FromIter { iter }
}

impl<I> Publisher<I::Item> for FromIter<I>
where
  I: IntoIterator + Clone + Send + Sync,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static,
{
  fn subscribe(&self, subscriber: BoxedSubscriber<I::Item>) {
    DemandSubscription::subscribe(IterSource(self.iter.clone().into_iter()), subscriber);
  }
}

struct IterSource<It>(It);

impl<It> Source for IterSource<It>
where
  It: Iterator + Send + 'static,
  It::Item: Send + 'static,
{
  type Item = It::Item;

  #[inline]
  fn pull(&mut self) -> Option<Result<It::Item, Error>> { self.0.next().map(Ok) }
}

// ==================== range ====================

/// Emits `count` consecutive integers starting at `start`.
///
/// A non-positive `count` completes on the first request. The sequence stops early
/// rather than wrap past `i64::MAX`.
#[derive(Clone, Copy, Debug)]
pub struct Range {
  start: i64,
  count: i64,
}

pub fn range(start: i64, count: i64) -> Range { Range { start, count: count.max(0) } }

impl Publisher<i64> for Range {
  fn subscribe(&self, subscriber: BoxedSubscriber<i64>) {
    let source = RangeSource { next: Some(self.start), remaining: self.count };
    DemandSubscription::subscribe(source, subscriber);
  }
}

struct RangeSource {
  next: Option<i64>,
  remaining: i64,
}

impl Source for RangeSource {
  type Item = i64;

  fn pull(&mut self) -> Option<Result<i64, Error>> {
    if self.remaining == 0 {
      return None;
    }
    let value = self.next?;
    self.remaining -= 1;
    self.next = value.checked_add(1);
    Some(Ok(value))
  }
}

// ==================== from_source ====================

/// Builds a fresh [`Source`] per subscription from `factory`.
///
/// ```rust
/// use rxflow::prelude::*;
///
/// let countdown = from_source(move || {
///   let mut n = 2;
///   move || {
///     n -= 1;
///     (n >= 0).then(|| Ok(n))
///   }
/// });
/// let ts = TestSubscriber::new(UNBOUNDED);
/// countdown.subscribe(ts.boxed());
/// ts.assert_values(&[1, 0]);
/// ts.assert_complete();
/// ```
pub struct FromSource<F> {
  factory: F,
}

pub fn from_source<F, G, T>(factory: F) -> FromSource<F>
where
  F: Fn() -> G,
  G: FnMut() -> Option<Result<T, Error>>,
{
  FromSource { factory }
}

impl<F, G, T> Publisher<T> for FromSource<F>
where
  F: Fn() -> G + Send + Sync,
  G: FnMut() -> Option<Result<T, Error>> + Send + 'static,
  T: Send + 'static,
{
  fn subscribe(&self, subscriber: BoxedSubscriber<T>) {
    DemandSubscription::subscribe(FnSource((self.factory)()), subscriber);
  }
}

struct FnSource<G>(G);

impl<G, T> Source for FnSource<G>
where
  G: FnMut() -> Option<Result<T, Error>> + Send + 'static,
  T: Send + 'static,
{
  type Item = T;

  #[inline]
  fn pull(&mut self) -> Option<Result<T, Error>> { (self.0)() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{subscription::UNBOUNDED, testing::TestSubscriber};

  #[rxflow_macro::test]
  fn from_iter_is_cold() {
    let source = from_iter(vec!['a', 'b', 'c']);

    let first = TestSubscriber::new(UNBOUNDED);
    source.subscribe(first.boxed());
    let second = TestSubscriber::new(2);
    source.subscribe(second.boxed());

    first.assert_values(&['a', 'b', 'c']);
    first.assert_complete();
    second.assert_values(&['a', 'b']);
    assert!(!second.is_terminated());
  }

  #[rxflow_macro::test]
  fn range_stops_at_max() {
    let ts = TestSubscriber::new(UNBOUNDED);
    range(i64::MAX - 1, 5).subscribe(ts.boxed());
    ts.assert_values(&[i64::MAX - 1, i64::MAX]);
    ts.assert_complete();
  }

  #[rxflow_macro::test]
  fn negative_count_is_empty() {
    let ts = TestSubscriber::<i64>::new(1);
    range(10, -3).subscribe(ts.boxed());
    ts.assert_values(&[]);
    ts.assert_complete();
  }

  #[rxflow_macro::test]
  fn source_error_terminates() {
    let failing = from_source(|| {
      let mut step = 0;
      move || {
        step += 1;
        match step {
          1 => Some(Ok(step)),
          _ => Some(Err(Error::msg("broken pipe"))),
        }
      }
    });
    let ts = TestSubscriber::new(UNBOUNDED);
    failing.subscribe(ts.boxed());
    ts.assert_values(&[1]);
    ts.assert_error("broken pipe");
  }
}
