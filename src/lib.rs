//! # rxflow: demand-driven push streams
//!
//! A small runtime for push-based streams where a consumer tells its producer
//! how many values it is ready for, can cancel at any time, and where every
//! timer or sub-subscription an operator owns is released deterministically.
//!
//! ```rust
//! use rxflow::prelude::*;
//!
//! let ts = TestSubscriber::new(2);
//! range(1, 5).subscribe(ts.boxed());
//! ts.assert_values(&[1, 2]);
//!
//! ts.request(UNBOUNDED);
//! ts.assert_values(&[1, 2, 3, 4, 5]);
//! ts.assert_complete();
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Subscriber`] | Receives `attach`, `next`, `error` and `complete` |
//! | [`Subscription`] | Demand handle: `request(n)` and `cancel()` |
//! | [`DemandSubscription`] | Drives a pull [`Source`] under consumer demand |
//! | [`SubscriptionArbiter`] | Swaps upstreams without losing demand |
//! | [`Disposable`] | Resource handle; see the single/serial/composite containers |
//! | [`Scheduler`] / [`Worker`] | Sequential, cancellable, delay-aware execution |
//! | [`EventLoopScheduler`] | Fixed pool of event loops, round-robin workers |
//! | [`TestScheduler`] | Virtual time for deterministic tests |
//! | [`PublisherExt`] | Operators: `scan`, `timeout`, `delay`, `delay_subscription` |
//! | [`using`] | A publisher owning a per-subscriber resource |
//!
//! ## Feature Flags
//!
//! - **`testing`** (default): [`TestSubscriber`], `TestPublisher` and test
//!   logging helpers.
//!
//! [`Subscriber`]: observer::Subscriber
//! [`Subscription`]: subscription::Subscription
//! [`DemandSubscription`]: subscription::DemandSubscription
//! [`Source`]: publisher::Source
//! [`SubscriptionArbiter`]: subscription::SubscriptionArbiter
//! [`Disposable`]: disposable::Disposable
//! [`Scheduler`]: scheduler::Scheduler
//! [`Worker`]: scheduler::Worker
//! [`EventLoopScheduler`]: scheduler::EventLoopScheduler
//! [`TestScheduler`]: scheduler::TestScheduler
//! [`PublisherExt`]: ops::PublisherExt
//! [`using`]: ops::using
//! [`TestSubscriber`]: testing::TestSubscriber

// Lets `::rxflow::...` paths emitted by `rxflow_macro` resolve inside the
// crate's own unit tests.
extern crate self as rxflow;

pub mod config;
pub mod disposable;
pub mod error;
pub mod hooks;
pub mod observer;
pub mod ops;
pub mod prelude;
pub mod publisher;
pub mod scheduler;
pub mod subscription;
#[cfg(feature = "testing")]
pub mod testing;

pub use prelude::*;
