//! Prelude module for convenient imports
//!
//! This module re-exports commonly used types and traits for easy access.

// Configuration
pub use crate::config::SchedulerConfig;
// Resource handles
pub use crate::disposable::{
  ActionDisposable, BooleanDisposable, CompositeDisposable, Disposable, DisposableRef,
  DisposeGuard, SerialDisposable, SingleAssignmentDisposable,
};
// Errors and the uncaught hook
pub use crate::error::Error;
pub use crate::hooks::{report_uncaught, reset_uncaught_hook, set_uncaught_hook};
// Consumers
pub use crate::observer::{BoxedSubscriber, FnSubscriber, Subscriber};
// Operators
pub use crate::ops::{using, PublisherExt};
// Producers
pub use crate::publisher::{
  empty, from_iter, from_source, never, range, throw, timer, Publisher, PublisherRef, Source,
};
// Schedulers
pub use crate::scheduler::{
  schedule_periodic, Action, Duration, EventLoopScheduler, EventLoopWorker, Scheduler,
  SchedulerRef, TaskHandle, TestScheduler, TestWorker, Worker, WorkerExt, WorkerRef,
};
// Demand
pub use crate::subscription::{
  DemandSubscription, EmptySubscription, Subscription, SubscriptionArbiter, SubscriptionRef,
  UNBOUNDED,
};
// Test helpers
#[cfg(feature = "testing")]
pub use crate::testing::{TestPublisher, TestSubscriber};
