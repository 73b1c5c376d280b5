//! The error type carried by the terminal `error` signal.
//!
//! Every stream in this crate fails with [`Error`]. It is cheap to clone so a
//! failure can be logged, handed to the uncaught hook and delivered to a
//! consumer without giving up ownership.

use std::{any::Any, borrow::Cow, sync::Arc, time::Duration};

use thiserror::Error;

/// Errors delivered through `Subscriber::error` or reported to the uncaught
/// hook.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum Error {
  /// A consumer requested a non-positive amount of values.
  #[error("request amount must be positive, got {0}")]
  InvalidRequest(i64),

  /// No value arrived within the timeout window and no fallback was given.
  #[error("no value received within {0:?}")]
  Timeout(Duration),

  /// A single-assignment container was assigned twice.
  #[error("disposable already assigned")]
  AlreadyAssigned,

  /// A user callback panicked.
  #[error("callback panicked: {0}")]
  Panicked(Cow<'static, str>),

  /// A failure raised by a producer.
  #[error("{0}")]
  Source(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
  /// Wraps an arbitrary producer failure.
  pub fn other<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Error::Source(Arc::new(err))
  }

  /// Builds a producer failure from a plain message.
  pub fn msg(message: impl Into<String>) -> Self {
    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Message(String);

    Error::Source(Arc::new(Message(message.into())))
  }

  /// Converts a `catch_unwind` payload into [`Error::Panicked`].
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = match payload.downcast::<&'static str>() {
      Ok(s) => Cow::Borrowed(*s),
      Err(payload) => match payload.downcast::<String>() {
        Ok(s) => Cow::Owned(*s),
        Err(_) => Cow::Borrowed("non-string panic payload"),
      },
    };
    Error::Panicked(message)
  }

  /// Returns a short stable label (snake_case) for logs.
  pub fn as_label(&self) -> &'static str {
    match self {
      Error::InvalidRequest(_) => "invalid_request",
      Error::Timeout(_) => "timeout",
      Error::AlreadyAssigned => "already_assigned",
      Error::Panicked(_) => "callback_panicked",
      Error::Source(_) => "source",
    }
  }

  /// True for errors caused by breaking the demand protocol.
  pub fn is_protocol_violation(&self) -> bool {
    matches!(self, Error::InvalidRequest(_) | Error::AlreadyAssigned)
  }
}

#[cfg(test)]
mod tests {
  use std::panic::catch_unwind;

  use super::*;

  #[rxflow_macro::test]
  fn labels_are_stable() {
    assert_eq!(Error::InvalidRequest(0).as_label(), "invalid_request");
    assert_eq!(Error::Timeout(Duration::from_millis(5)).as_label(), "timeout");
    assert_eq!(Error::msg("boom").as_label(), "source");
    assert!(Error::InvalidRequest(-1).is_protocol_violation());
    assert!(!Error::msg("boom").is_protocol_violation());
  }

  #[rxflow_macro::test]
  fn panic_payloads_become_messages() {
    let err = Error::from_panic(catch_unwind(|| panic!("static str")).unwrap_err());
    assert_eq!(err.to_string(), "callback panicked: static str");

    let err = Error::from_panic(catch_unwind(|| panic!("formatted {}", 42)).unwrap_err());
    assert_eq!(err.to_string(), "callback panicked: formatted 42");

    let err = Error::from_panic(Box::new(7_u8));
    assert_eq!(err.to_string(), "callback panicked: non-string panic payload");
  }

  #[rxflow_macro::test]
  fn source_errors_display_inner_message() {
    let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
    assert_eq!(Error::other(io).to_string(), "disk gone");
    assert_eq!(Error::msg("plain").to_string(), "plain");
  }
}
