//! Resource handles with at-most-once release.
//!
//! A [`Disposable`] is anything that can be released: a scheduled task, a
//! worker, an upstream subscription, or a container of other disposables.
//! The containers ([`CompositeDisposable`], [`SerialDisposable`],
//! [`SingleAssignmentDisposable`]) share one contract:
//!
//! - disposal is idempotent and every child is disposed exactly once, even
//!   when `add`, `remove` and `dispose` race from different threads;
//! - a child handed to an already-disposed container is disposed
//!   synchronously instead of being stored;
//! - children are never disposed while the container's internal lock is
//!   held, so a child's disposal callback may freely call back into the
//!   container.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use parking_lot::Mutex;

use crate::hooks::guard_uncaught;

mod composite;
mod serial;
mod single;

pub use composite::CompositeDisposable;
pub use serial::SerialDisposable;
pub use single::SingleAssignmentDisposable;

/// A releasable resource.
pub trait Disposable: Send + Sync {
  /// Releases the resource. Calling it again is a no-op.
  fn dispose(&self);

  fn is_disposed(&self) -> bool;
}

/// Shared, type-erased disposable. Containers identify children by the
/// address of this `Arc`.
pub type DisposableRef = Arc<dyn Disposable>;

impl<T: Disposable + ?Sized> Disposable for Box<T> {
  #[inline]
  fn dispose(&self) { (**self).dispose() }

  #[inline]
  fn is_disposed(&self) -> bool { (**self).is_disposed() }
}

impl<T: Disposable + ?Sized> Disposable for Arc<T> {
  #[inline]
  fn dispose(&self) { (**self).dispose() }

  #[inline]
  fn is_disposed(&self) -> bool { (**self).is_disposed() }
}

/// Disposes `d`, routing a panic from its release logic to the uncaught hook
/// so the signal that triggered the disposal is not masked.
pub(crate) fn dispose_quietly(d: &dyn Disposable) { guard_uncaught(|| d.dispose()) }

/// True when `a` and `b` point at the same allocation.
#[inline]
pub(crate) fn same_disposable(a: &DisposableRef, b: &DisposableRef) -> bool {
  std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// ==================== Leaf disposables ====================

/// A disposable that only records whether it was disposed.
#[derive(Debug, Default)]
pub struct BooleanDisposable {
  disposed: AtomicBool,
}

impl BooleanDisposable {
  pub fn new() -> Self { Self::default() }

  /// A handle that is born disposed.
  pub fn disposed() -> Self { Self { disposed: AtomicBool::new(true) } }
}

impl Disposable for BooleanDisposable {
  #[inline]
  fn dispose(&self) { self.disposed.store(true, Ordering::Release); }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

/// Runs a release callback the first time it is disposed.
pub struct ActionDisposable {
  disposed: AtomicBool,
  action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ActionDisposable {
  pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
    Self {
      disposed: AtomicBool::new(false),
      action: Mutex::new(Some(Box::new(action))),
    }
  }
}

impl Disposable for ActionDisposable {
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    let action = self.action.lock().take();
    if let Some(action) = action {
      action();
    }
  }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

/// Wraps `action` so it runs once, on first disposal.
pub fn from_fn(action: impl FnOnce() + Send + 'static) -> DisposableRef {
  Arc::new(ActionDisposable::new(action))
}

/// A fresh, not yet disposed, handle with no release logic.
pub fn empty() -> DisposableRef { Arc::new(BooleanDisposable::new()) }

/// An already disposed handle, returned where there is nothing left to
/// cancel.
pub fn disposed() -> DisposableRef { Arc::new(BooleanDisposable::disposed()) }

/// An RAII guard that disposes the wrapped handle when dropped.
///
/// If you don't bind the guard to a variable it is dropped, and the handle
/// disposed, immediately.
#[must_use]
pub struct DisposeGuard(Option<DisposableRef>);

impl DisposeGuard {
  pub fn new(d: DisposableRef) -> Self { Self(Some(d)) }

  /// Gives the handle back without disposing it.
  pub fn into_inner(mut self) -> DisposableRef {
    match self.0.take() {
      Some(d) => d,
      None => disposed(),
    }
  }
}

impl Drop for DisposeGuard {
  fn drop(&mut self) {
    if let Some(d) = self.0.take() {
      dispose_quietly(&*d);
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::sync::atomic::AtomicUsize;

  use super::*;

  /// Counts every call to `dispose`, including repeated ones.
  #[derive(Default)]
  pub(crate) struct Counting(pub(crate) AtomicUsize);

  impl Counting {
    pub(crate) fn count(&self) -> usize { self.0.load(Ordering::SeqCst) }
  }

  impl Disposable for Counting {
    fn dispose(&self) { self.0.fetch_add(1, Ordering::SeqCst); }

    fn is_disposed(&self) -> bool { self.count() > 0 }
  }

  #[rxflow_macro::test]
  fn action_runs_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let d = from_fn(move || {
      h.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!d.is_disposed());
    d.dispose();
    d.dispose();
    assert!(d.is_disposed());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[rxflow_macro::test]
  fn disposed_handle_starts_disposed() {
    assert!(disposed().is_disposed());
    assert!(!empty().is_disposed());
  }

  #[rxflow_macro::test]
  fn guard_disposes_on_drop() {
    let counting = Arc::new(Counting::default());
    {
      let _guard = DisposeGuard::new(counting.clone());
    }
    assert_eq!(counting.count(), 1);

    let guard = DisposeGuard::new(counting.clone());
    let inner = guard.into_inner();
    assert_eq!(counting.count(), 1);
    inner.dispose();
    assert_eq!(counting.count(), 2);
  }
}
