//! Process-wide uncaught-error hook.
//!
//! Failures that have no consumer left to receive them (a panicking disposal
//! callback, an error raised after the terminal signal, a panic inside a
//! scheduled action) end up here instead of unwinding through a worker
//! thread.

use std::{
  panic::{catch_unwind, AssertUnwindSafe},
  sync::Arc,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::Error;

type UncaughtHook = Arc<dyn Fn(&Error) + Send + Sync>;

static UNCAUGHT_HOOK: Lazy<RwLock<Option<UncaughtHook>>> = Lazy::new(|| RwLock::new(None));

/// Installs `hook` as the receiver of uncaught errors, replacing any previous
/// one.
pub fn set_uncaught_hook(hook: impl Fn(&Error) + Send + Sync + 'static) {
  *UNCAUGHT_HOOK.write() = Some(Arc::new(hook));
}

/// Restores the default behaviour of logging uncaught errors.
pub fn reset_uncaught_hook() { *UNCAUGHT_HOOK.write() = None; }

/// Hands `err` to the installed hook, or logs it at `error` level.
pub fn report_uncaught(err: Error) {
  let hook = UNCAUGHT_HOOK.read().clone();
  match hook {
    Some(hook) => {
      if catch_unwind(AssertUnwindSafe(|| hook(&err))).is_err() {
        tracing::error!(label = err.as_label(), error = %err, "uncaught error hook panicked");
      }
    }
    None => tracing::error!(label = err.as_label(), error = %err, "uncaught error"),
  }
}

/// Runs `f`, converting a panic into [`Error::Panicked`].
pub(crate) fn guard<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
  catch_unwind(AssertUnwindSafe(f)).map_err(Error::from_panic)
}

/// Runs `f` and reports a panic to the uncaught hook.
pub(crate) fn guard_uncaught(f: impl FnOnce()) {
  if let Err(err) = guard(f) {
    report_uncaught(err);
  }
}
