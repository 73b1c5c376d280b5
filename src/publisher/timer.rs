use std::sync::Arc;

use parking_lot::Mutex;

use super::Publisher;
use crate::{
  disposable::{Disposable, SingleAssignmentDisposable},
  error::Error,
  hooks::{guard, guard_uncaught},
  observer::BoxedSubscriber,
  scheduler::{worker_disposable, Duration, SchedulerRef, WorkerExt},
  subscription::Subscription,
};

/// Emits `0` once `delay` has elapsed on `scheduler`, then completes.
///
/// The value is held back until it has been requested, so a slow consumer
/// receives it late rather than never.
#[derive(Clone)]
pub struct Timer {
  delay: Duration,
  scheduler: SchedulerRef,
}

pub fn timer(delay: Duration, scheduler: SchedulerRef) -> Timer { Timer { delay, scheduler } }

impl Publisher<u64> for Timer {
  fn subscribe(&self, mut subscriber: BoxedSubscriber<u64>) {
    let sub = Arc::new(TimerSubscription {
      state: Mutex::new(TimerState::default()),
      worker: SingleAssignmentDisposable::new(),
    });
    if let Err(err) = guard(|| subscriber.attach(sub.clone())) {
      sub.state.lock().finished = true;
      guard_uncaught(|| subscriber.error(err));
      return;
    }
    sub.state.lock().subscriber = Some(subscriber);
    if sub.settle() {
      return;
    }

    let worker = self.scheduler.create_worker();
    if !sub.worker.set(worker_disposable(&worker)) {
      return;
    }
    let fired = sub.clone();
    worker.schedule_fn_after(self.delay, move || {
      fired.state.lock().fired = true;
      fired.settle();
    });
  }
}

struct TimerSubscription {
  state: Mutex<TimerState>,
  worker: SingleAssignmentDisposable,
}

#[derive(Default)]
struct TimerState {
  subscriber: Option<BoxedSubscriber<u64>>,
  requested: bool,
  fired: bool,
  invalid: Option<i64>,
  finished: bool,
}

enum Outcome {
  Tick,
  Invalid(i64),
}

impl TimerSubscription {
  /// Delivers whatever is ready. Returns `true` once the run is over.
  fn settle(&self) -> bool {
    let (outcome, mut subscriber) = {
      let mut st = self.state.lock();
      if st.finished {
        return true;
      }
      let outcome = match st.invalid {
        Some(n) => Outcome::Invalid(n),
        None if st.fired && st.requested => Outcome::Tick,
        None => return false,
      };
      let Some(subscriber) = st.subscriber.take() else {
        // Still attaching; the subscribing thread settles afterwards.
        return false;
      };
      st.finished = true;
      (outcome, subscriber)
    };

    self.worker.dispose();
    match outcome {
      Outcome::Tick => match guard(|| subscriber.next(0)) {
        Ok(()) => guard_uncaught(|| subscriber.complete()),
        Err(err) => guard_uncaught(|| subscriber.error(err)),
      },
      Outcome::Invalid(n) => guard_uncaught(|| subscriber.error(Error::InvalidRequest(n))),
    }
    true
  }
}

impl Subscription for TimerSubscription {
  fn request(&self, n: i64) {
    {
      let mut st = self.state.lock();
      if n <= 0 {
        st.invalid.get_or_insert(n);
      } else {
        st.requested = true;
      }
    }
    self.settle();
  }

  fn cancel(&self) {
    let subscriber = {
      let mut st = self.state.lock();
      st.finished = true;
      st.subscriber.take()
    };
    self.worker.dispose();
    drop(subscriber);
  }

  fn is_cancelled(&self) -> bool { self.state.lock().finished }
}
