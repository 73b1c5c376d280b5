use std::{
  sync::Arc,
  thread::{self, ThreadId},
};

use parking_lot::{Mutex, MutexGuard};

use super::{add_cap, Subscription, SubscriptionRef, UNBOUNDED};
use crate::{
  disposable::{CompositeDisposable, Disposable},
  error::Error,
  hooks::{guard, guard_uncaught},
  observer::{BoxedSubscriber, Subscriber},
};

/// Presents one stable [`Subscription`] to a downstream subscriber while the
/// upstream behind it is swapped.
///
/// Downstream demand that the current upstream has not satisfied yet is
/// carried over to the next one. Each upstream is tagged with a generation;
/// signals from a superseded generation are dropped.
///
/// # Locking
///
/// Two locks, always taken in this order: `downstream`, held while a value
/// is delivered, then `state`, held only for bookkeeping. Upstream
/// `request`/`cancel` calls and terminal signals happen with neither held,
/// except that a terminal signal raised while another thread is delivering
/// is parked and handed over by that thread once it is done.
///
/// Switching upstreams waits for a value another thread is delivering, so
/// once [`set_subscription`](Self::set_subscription) or
/// [`detach`](Self::detach) returns nothing from the previous upstream
/// reaches the downstream. A switch made from inside the delivery itself
/// does not wait for it.
pub struct SubscriptionArbiter<T> {
  downstream: Mutex<Option<BoxedSubscriber<T>>>,
  state: Mutex<ArbiterState>,
  resources: CompositeDisposable,
}

#[derive(Default)]
struct ArbiterState {
  current: Option<SubscriptionRef>,
  generation: u64,
  /// Requested by downstream and not delivered yet.
  outstanding: i64,
  terminated: bool,
  cancelled: bool,
  pending: Option<Terminal>,
  /// Thread currently inside the downstream's `next`.
  delivering: Option<ThreadId>,
}

enum Terminal {
  Complete,
  Error(Error),
}

impl<T: Send + 'static> SubscriptionArbiter<T> {
  /// Creates an arbiter and attaches `downstream` to it. Nothing is
  /// requested upstream until [`set_subscription`](Self::set_subscription).
  pub fn attach(mut downstream: BoxedSubscriber<T>) -> Arc<Self> {
    let this = Arc::new(Self {
      downstream: Mutex::new(None),
      state: Mutex::new(ArbiterState::default()),
      resources: CompositeDisposable::new(),
    });
    if let Err(err) = guard(|| downstream.attach(this.clone())) {
      this.cancel();
      guard_uncaught(|| downstream.error(err));
      return this;
    }
    *this.downstream.lock() = Some(downstream);
    this.flush_terminal();
    this
  }

  /// A subscriber for the next upstream. Its generation is fixed when the
  /// upstream attaches to it.
  pub fn upstream(self: &Arc<Self>) -> ArbiterSubscriber<T> {
    ArbiterSubscriber { arbiter: self.clone(), generation: None }
  }

  /// Makes `sub` the current upstream, cancels the previous one and
  /// forwards the outstanding demand. Returns the new generation, or `None`
  /// (after cancelling `sub`) when the arbiter is already finished.
  pub fn set_subscription(&self, sub: SubscriptionRef) -> Option<u64> {
    let switched = {
      let slot = self.quiesce();
      let mut st = self.state.lock();
      let switched = if st.terminated || st.cancelled {
        None
      } else {
        st.generation += 1;
        let previous = st.current.replace(sub.clone());
        Some((previous, st.generation, st.outstanding))
      };
      drop(st);
      drop(slot);
      switched
    };
    self.flush_terminal();
    let Some((previous, generation, demand)) = switched else {
      sub.cancel();
      return None;
    };
    if let Some(previous) = previous {
      previous.cancel();
    }
    tracing::trace!(generation, outstanding = demand, "upstream switched");
    if demand > 0 {
      sub.request(demand);
    }
    Some(generation)
  }

  /// Cancels the current upstream and makes its in-flight signals stale,
  /// leaving the downstream waiting for the next one. Returns `false` when
  /// the arbiter is already finished.
  pub fn detach(&self) -> bool {
    let previous = {
      let slot = self.quiesce();
      let mut st = self.state.lock();
      let previous = if st.terminated || st.cancelled {
        None
      } else {
        st.generation += 1;
        Some(st.current.take())
      };
      drop(st);
      drop(slot);
      previous
    };
    self.flush_terminal();
    let Some(previous) = previous else {
      return false;
    };
    if let Some(previous) = previous {
      previous.cancel();
    }
    true
  }

  /// Waits out a value that another thread is delivering and holds the
  /// downstream until the guard drops. `None` when the calling thread is
  /// the one delivering.
  fn quiesce(&self) -> Option<MutexGuard<'_, Option<BoxedSubscriber<T>>>> {
    if self.state.lock().delivering == Some(thread::current().id()) {
      return None;
    }
    Some(self.downstream.lock())
  }

  /// Cancels the current upstream and rejects every later one, without
  /// signalling the downstream. Returns `false` when already finished.
  pub fn mark_terminal(&self) -> bool {
    let previous = {
      let mut st = self.state.lock();
      if st.terminated || st.cancelled {
        return false;
      }
      st.terminated = true;
      st.generation += 1;
      st.current.take()
    };
    if let Some(previous) = previous {
      previous.cancel();
    }
    self.resources.dispose();
    true
  }

  /// Terminates the downstream with `err` on behalf of the owning operator
  /// and cancels the current upstream.
  pub fn fail(&self, err: Error) {
    let previous = {
      let mut st = self.state.lock();
      if st.terminated || st.cancelled {
        return;
      }
      st.terminated = true;
      st.generation += 1;
      st.pending = Some(Terminal::Error(err));
      st.current.take()
    };
    if let Some(previous) = previous {
      previous.cancel();
    }
    self.flush_terminal();
  }

  /// Delivers `value` when `generation` is current. Returns whether it was
  /// delivered.
  pub fn next(&self, generation: u64, value: T) -> bool {
    let mut downstream = self.downstream.lock();
    {
      let mut st = self.state.lock();
      if st.generation != generation || st.terminated || st.cancelled {
        tracing::trace!(generation, current = st.generation, "dropping stale value");
        return false;
      }
      if st.outstanding != UNBOUNDED {
        st.outstanding = (st.outstanding - 1).max(0);
      }
      st.delivering = Some(thread::current().id());
    }
    let outcome = match downstream.as_mut() {
      Some(d) => guard(|| d.next(value)),
      None => Ok(()),
    };
    self.state.lock().delivering = None;
    drop(downstream);

    match outcome {
      Ok(()) => self.flush_terminal(),
      Err(err) => self.fail(err),
    }
    true
  }

  pub fn complete(&self, generation: u64) { self.terminate(generation, Terminal::Complete) }

  pub fn error(&self, generation: u64, err: Error) {
    self.terminate(generation, Terminal::Error(err))
  }

  /// Resources owned by the operator driving this arbiter, disposed when
  /// the downstream is terminated or cancels.
  pub fn resources(&self) -> &CompositeDisposable { &self.resources }

  /// Demand requested downstream and not delivered yet.
  pub fn outstanding(&self) -> i64 { self.state.lock().outstanding }

  pub fn is_terminated(&self) -> bool {
    let st = self.state.lock();
    st.terminated || st.cancelled
  }

  fn terminate(&self, generation: u64, signal: Terminal) {
    {
      let mut st = self.state.lock();
      if st.generation != generation || st.terminated || st.cancelled {
        tracing::trace!(generation, current = st.generation, "dropping stale terminal signal");
        return;
      }
      st.terminated = true;
      st.current = None;
      st.pending = Some(signal);
    }
    self.flush_terminal();
  }

  /// Hands a parked terminal signal to the downstream, or drops the
  /// downstream after cancellation. A no-op while another thread holds the
  /// downstream; that thread flushes again once it lets go.
  fn flush_terminal(&self) {
    let Some(mut slot) = self.downstream.try_lock() else {
      return;
    };
    let signal = {
      let mut st = self.state.lock();
      if st.cancelled {
        None
      } else {
        match st.pending.take() {
          Some(signal) => Some(signal),
          None => return,
        }
      }
    };
    let downstream = slot.take();
    drop(slot);
    self.resources.dispose();

    if let (Some(signal), Some(mut downstream)) = (signal, downstream) {
      guard_uncaught(|| match signal {
        Terminal::Complete => downstream.complete(),
        Terminal::Error(err) => downstream.error(err),
      });
    }
  }
}

impl<T: Send + 'static> Subscription for SubscriptionArbiter<T> {
  fn request(&self, n: i64) {
    if n <= 0 {
      let previous = {
        let mut st = self.state.lock();
        if st.terminated || st.cancelled {
          return;
        }
        st.terminated = true;
        st.generation += 1;
        st.pending = Some(Terminal::Error(Error::InvalidRequest(n)));
        st.current.take()
      };
      tracing::debug!(amount = n, "non-positive request");
      if let Some(previous) = previous {
        previous.cancel();
      }
      self.flush_terminal();
      return;
    }

    let current = {
      let mut st = self.state.lock();
      if st.terminated || st.cancelled {
        return;
      }
      st.outstanding = add_cap(st.outstanding, n);
      st.current.clone()
    };
    if let Some(current) = current {
      current.request(n);
    }
  }

  fn cancel(&self) {
    let previous = {
      let mut st = self.state.lock();
      if st.cancelled {
        return;
      }
      st.cancelled = true;
      st.pending = None;
      st.generation += 1;
      st.current.take()
    };
    if let Some(previous) = previous {
      previous.cancel();
    }
    self.resources.dispose();
    // A delivering thread drops the downstream itself on its way out.
    let downstream = self.downstream.try_lock().and_then(|mut slot| slot.take());
    drop(downstream);
  }

  fn is_cancelled(&self) -> bool { self.state.lock().cancelled }
}

/// Subscriber handed to one upstream of a [`SubscriptionArbiter`].
pub struct ArbiterSubscriber<T> {
  arbiter: Arc<SubscriptionArbiter<T>>,
  generation: Option<u64>,
}

impl<T: Send + 'static> Subscriber<T> for ArbiterSubscriber<T> {
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
    match self.generation {
      Some(generation) => self.arbiter.error(generation, err),
      None => tracing::trace!(error = %err, "error before attach dropped"),
    }
  }

  fn complete(&mut self) {
    if let Some(generation) = self.generation {
      self.arbiter.complete(generation);
    }
  }
}
