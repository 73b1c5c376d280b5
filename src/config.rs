//! # Scheduler configuration.
//!
//! [`SchedulerConfig`] sizes the event-loop pool and names its threads.
//!
//! # Example
//! ```
//! use rxflow::config::SchedulerConfig;
//!
//! let mut cfg = SchedulerConfig::default();
//! cfg.max_threads = 2;
//!
//! assert!(cfg.pool_size() >= 1);
//! assert!(cfg.pool_size() <= 2);
//! ```

use std::{num::NonZeroUsize, thread};

/// Environment variable capping the number of event-loop threads.
///
/// Zero or an unset variable means "use the available parallelism". Values
/// above the available parallelism are capped.
pub const MAX_THREADS_ENV: &str = "RXFLOW_MAX_COMPUTATION_THREADS";

const DEFAULT_THREAD_NAME_PREFIX: &str = "rxflow-computation-";

/// Configuration of an [`EventLoopScheduler`] pool.
///
/// [`EventLoopScheduler`]: crate::scheduler::EventLoopScheduler
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
  /// Upper bound on pool threads (0 = available parallelism).
  pub max_threads: usize,
  /// Prefix of pool thread names; the slot index is appended.
  pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
  /// - `max_threads = 0` (available parallelism)
  /// - `thread_name_prefix = "rxflow-computation-"`
  fn default() -> Self {
    Self {
      max_threads: 0,
      thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_owned(),
    }
  }
}

impl SchedulerConfig {
  /// Defaults overridden by [`MAX_THREADS_ENV`] when it holds a valid number.
  pub fn from_env() -> Self {
    let mut cfg = Self::default();
    if let Ok(raw) = std::env::var(MAX_THREADS_ENV) {
      match raw.trim().parse::<usize>() {
        Ok(n) => cfg.max_threads = n,
        Err(err) => tracing::warn!(
          var = MAX_THREADS_ENV,
          value = %raw,
          error = %err,
          "ignoring invalid thread cap"
        ),
      }
    }
    cfg
  }

  /// Number of event loops: the available parallelism, lowered to
  /// `max_threads` when that is non-zero and smaller.
  pub fn pool_size(&self) -> usize {
    let available = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    capped(self.max_threads, available)
  }
}

fn capped(max_threads: usize, available: usize) -> usize {
  if max_threads == 0 || max_threads > available {
    available
  } else {
    max_threads
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[rxflow_macro::test]
  fn zero_means_available() {
    assert_eq!(capped(0, 8), 8);
  }

  #[rxflow_macro::test]
  fn cap_never_exceeds_available() {
    assert_eq!(capped(16, 8), 8);
    assert_eq!(capped(3, 8), 3);
    assert_eq!(capped(1, 1), 1);
  }

  #[rxflow_macro::test]
  fn default_prefix() {
    let cfg = SchedulerConfig::default();
    assert_eq!(cfg.thread_name_prefix, "rxflow-computation-");
    assert!(cfg.pool_size() >= 1);
  }
}
