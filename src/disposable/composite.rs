use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{dispose_quietly, same_disposable, Disposable, DisposableRef};

/// A set of disposables released together.
///
/// # Design
///
/// - The `disposed` flag flips before the child list is drained, and `add`
///   checks the flag while holding the list lock. A child is therefore either
///   drained by `dispose` or rejected (and disposed) by `add`, never both and
///   never neither.
/// - The lock only guards pushes, removals and the drain itself; children
///   are disposed after it is released.
/// - **SmallVec Optimization**: operators rarely own more than a handful of
///   resources, so the first four live inline.
///
/// # Examples
///
/// ```rust
/// use rxflow::disposable::{self, CompositeDisposable, Disposable};
///
/// let composite = CompositeDisposable::new();
/// let timer = disposable::empty();
/// assert!(composite.add(timer.clone()));
///
/// composite.dispose();
/// assert!(timer.is_disposed());
///
/// // Too late: disposed on the spot.
/// let late = disposable::empty();
/// assert!(!composite.add(late.clone()));
/// assert!(late.is_disposed());
/// ```
#[derive(Default)]
pub struct CompositeDisposable {
  disposed: AtomicBool,
  children: Mutex<SmallVec<[DisposableRef; 4]>>,
}

impl CompositeDisposable {
  pub fn new() -> Self { Self::default() }

  /// Stores `child`. Returns `false`, after disposing `child`, when the
  /// composite is already disposed.
  pub fn add(&self, child: DisposableRef) -> bool {
    {
      let mut children = self.children.lock();
      if !self.disposed.load(Ordering::Acquire) {
        children.push(child);
        return true;
      }
    }
    dispose_quietly(&*child);
    false
  }

  /// Detaches `child` without disposing it. Returns whether it was held.
  pub fn remove(&self, child: &DisposableRef) -> bool {
    let mut children = self.children.lock();
    match children.iter().position(|c| same_disposable(c, child)) {
      Some(idx) => {
        children.swap_remove(idx);
        true
      }
      None => false,
    }
  }

  /// Detaches `child` and disposes it. Returns whether it was held.
  pub fn delete(&self, child: &DisposableRef) -> bool {
    let removed = self.remove(child);
    if removed {
      dispose_quietly(&**child);
    }
    removed
  }

  /// Disposes the current children but keeps accepting new ones.
  pub fn clear(&self) {
    let children = std::mem::take(&mut *self.children.lock());
    children.iter().for_each(|c| dispose_quietly(&**c));
  }

  /// Number of children currently held.
  pub fn len(&self) -> usize { self.children.lock().len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Disposable for CompositeDisposable {
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    let children = std::mem::take(&mut *self.children.lock());
    children.iter().for_each(|c| dispose_quietly(&**c));
  }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{atomic::AtomicUsize, Arc, Barrier},
    thread,
  };

  use super::*;
  use crate::disposable::{from_fn, tests::Counting};

  #[rxflow_macro::test]
  fn dispose_releases_every_child_once() {
    let composite = CompositeDisposable::new();
    let children: Vec<_> = (0..5).map(|_| Arc::new(Counting::default())).collect();
    for c in &children {
      assert!(composite.add(c.clone()));
    }
    assert_eq!(composite.len(), 5);

    composite.dispose();
    composite.dispose();

    assert!(composite.is_disposed());
    assert!(composite.is_empty());
    assert!(children.iter().all(|c| c.count() == 1));
  }

  #[rxflow_macro::test]
  fn add_after_dispose_disposes_synchronously() {
    let composite = CompositeDisposable::new();
    composite.dispose();

    let late = Arc::new(Counting::default());
    assert!(!composite.add(late.clone()));
    assert_eq!(late.count(), 1);

    composite.dispose();
    assert_eq!(late.count(), 1);
  }

  #[rxflow_macro::test]
  fn remove_detaches_without_disposing() {
    let composite = CompositeDisposable::new();
    let kept: DisposableRef = Arc::new(Counting::default());
    let moved = Arc::new(Counting::default());
    let moved_ref: DisposableRef = moved.clone();
    composite.add(kept.clone());
    composite.add(moved_ref.clone());

    assert!(composite.remove(&moved_ref));
    assert!(!composite.remove(&moved_ref));
    composite.dispose();

    assert_eq!(moved.count(), 0);
    assert!(kept.is_disposed());
  }

  #[rxflow_macro::test]
  fn delete_and_clear_dispose_but_keep_composite_open() {
    let composite = CompositeDisposable::new();
    let a = Arc::new(Counting::default());
    let a_ref: DisposableRef = a.clone();
    let b = Arc::new(Counting::default());
    composite.add(a_ref.clone());
    composite.add(b.clone());

    assert!(composite.delete(&a_ref));
    assert_eq!(a.count(), 1);

    composite.clear();
    assert_eq!(b.count(), 1);
    assert!(!composite.is_disposed());

    let c = Arc::new(Counting::default());
    assert!(composite.add(c.clone()));
    assert_eq!(c.count(), 0);
  }

  #[rxflow_macro::test]
  fn dispose_from_child_callback_does_not_deadlock() {
    let composite = Arc::new(CompositeDisposable::new());
    let inner = composite.clone();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    composite.add(from_fn(move || {
      h.fetch_add(1, Ordering::SeqCst);
      inner.dispose();
      inner.add(crate::disposable::empty());
    }));
    composite.add(from_fn(|| {}));

    composite.dispose();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[rxflow_macro::test]
  fn panicking_child_does_not_stop_the_others() {
    let composite = CompositeDisposable::new();
    let after = Arc::new(Counting::default());
    composite.add(from_fn(|| panic!("release failed")));
    composite.add(after.clone());

    composite.dispose();
    assert_eq!(after.count(), 1);
  }

  #[rxflow_macro::test]
  fn concurrent_add_and_dispose_release_each_child_once() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    let composite = Arc::new(CompositeDisposable::new());
    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let children: Vec<Vec<Arc<Counting>>> = (0..THREADS)
      .map(|_| (0..PER_THREAD).map(|_| Arc::new(Counting::default())).collect())
      .collect();

    let handles: Vec<_> = children
      .iter()
      .cloned()
      .map(|batch| {
        let composite = composite.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          for c in batch {
            composite.add(c);
          }
        })
      })
      .collect();

    barrier.wait();
    composite.dispose();
    for h in handles {
      h.join().unwrap();
    }

    for c in children.iter().flatten() {
      assert_eq!(c.count(), 1);
    }
  }
}
