use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{dispose_quietly, Disposable, DisposableRef};

/// Holds one active disposable, releasing the previous one on every `set`.
///
/// Used where a resource is repeatedly superseded, such as the timeout timer
/// that is re-armed after every value.
#[derive(Default)]
pub struct SerialDisposable {
  disposed: AtomicBool,
  current: Mutex<Option<DisposableRef>>,
}

impl SerialDisposable {
  pub fn new() -> Self { Self::default() }

  /// Makes `next` current and disposes the previous one. Returns `false`,
  /// after disposing `next`, when this container is already disposed.
  pub fn set(&self, next: DisposableRef) -> bool {
    match self.swap(next) {
      Ok(previous) => {
        if let Some(previous) = previous {
          dispose_quietly(&*previous);
        }
        true
      }
      Err(next) => {
        dispose_quietly(&*next);
        false
      }
    }
  }

  /// Makes `next` current without disposing the previous one, which is
  /// returned to the caller. `Err` hands `next` back, already disposed,
  /// when this container is disposed.
  pub fn replace(&self, next: DisposableRef) -> Result<Option<DisposableRef>, DisposableRef> {
    self.swap(next).map_err(|next| {
      dispose_quietly(&*next);
      next
    })
  }

  /// The current disposable, if any.
  pub fn get(&self) -> Option<DisposableRef> { self.current.lock().clone() }

  fn swap(&self, next: DisposableRef) -> Result<Option<DisposableRef>, DisposableRef> {
    let mut current = self.current.lock();
    if self.disposed.load(Ordering::Acquire) {
      return Err(next);
    }
    Ok(current.replace(next))
  }
}

impl Disposable for SerialDisposable {
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    let current = self.current.lock().take();
    if let Some(current) = current {
      dispose_quietly(&*current);
    }
  }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}
