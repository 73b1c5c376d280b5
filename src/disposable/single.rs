use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{dispose_quietly, Disposable, DisposableRef};
use crate::{error::Error, hooks::report_uncaught};

/// Holds at most one disposable, assigned once.
///
/// A second assignment is a programming error: the late disposable is
/// disposed and [`Error::AlreadyAssigned`] goes to the uncaught hook.
#[derive(Default)]
pub struct SingleAssignmentDisposable {
  disposed: AtomicBool,
  slot: Mutex<Slot>,
}

#[derive(Default)]
enum Slot {
  #[default]
  Empty,
  Assigned(DisposableRef),
  Released,
}

impl SingleAssignmentDisposable {
  pub fn new() -> Self { Self::default() }

  /// Stores `d`. Returns `false`, after disposing `d`, when this container
  /// was disposed or already assigned.
  pub fn set(&self, d: DisposableRef) -> bool {
    let rejected_twice = {
      let mut slot = self.slot.lock();
      match &*slot {
        Slot::Empty if !self.disposed.load(Ordering::Acquire) => {
          *slot = Slot::Assigned(d);
          return true;
        }
        Slot::Assigned(_) => true,
        Slot::Empty | Slot::Released => false,
      }
    };
    dispose_quietly(&*d);
    if rejected_twice {
      tracing::warn!("single-assignment disposable assigned twice");
      report_uncaught(Error::AlreadyAssigned);
    }
    false
  }

  /// The assigned disposable, if any.
  pub fn get(&self) -> Option<DisposableRef> {
    match &*self.slot.lock() {
      Slot::Assigned(d) => Some(d.clone()),
      Slot::Empty | Slot::Released => None,
    }
  }
}

impl Disposable for SingleAssignmentDisposable {
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Released);
    if let Slot::Assigned(d) = previous {
      dispose_quietly(&*d);
    }
  }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::disposable::tests::Counting;

  #[rxflow_macro::test]
  fn holds_first_assignment() {
    let single = SingleAssignmentDisposable::new();
    let first = Arc::new(Counting::default());
    assert!(single.set(first.clone()));
    assert!(single.get().is_some());

    single.dispose();
    single.dispose();
    assert_eq!(first.count(), 1);
  }

  #[rxflow_macro::test]
  fn second_assignment_is_rejected_and_disposed() {
    let single = SingleAssignmentDisposable::new();
    let first = Arc::new(Counting::default());
    let second = Arc::new(Counting::default());
    single.set(first.clone());

    assert!(!single.set(second.clone()));
    assert_eq!(second.count(), 1);
    assert_eq!(first.count(), 0);
  }

  #[rxflow_macro::test]
  fn set_after_dispose_disposes_argument() {
    let single = SingleAssignmentDisposable::new();
    single.dispose();

    let late = Arc::new(Counting::default());
    assert!(!single.set(late.clone()));
    assert_eq!(late.count(), 1);
    assert!(single.get().is_none());
  }
}
