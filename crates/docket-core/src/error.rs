//! Error types for `docket-core`.

use serde::Serialize;
use thiserror::Error;

use crate::source::QueryKey;

/// A raw document failed to decode into a typed record.
///
/// `path` names the offending field using dotted notation, e.g.
/// `personName.surname`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid document at `{path}`: {message}")]
pub struct ValidationError {
  pub path:    String,
  pub message: String,
}

impl ValidationError {
  pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      path:    path.into(),
      message: message.into(),
    }
  }
}

/// A listener failure reported by a document source. Captured in the
/// subscription's state rather than returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct SubscriptionError {
  /// Source-specific error code, e.g. `permission-denied`.
  pub code:    String,
  pub message: String,
}

impl SubscriptionError {
  pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      code:    code.into(),
      message: message.into(),
    }
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error("subscription error: {0}")]
  Subscription(#[from] SubscriptionError),

  /// A delivery carried a generation that was never handed out. Stale
  /// generations are discarded silently; this one indicates a broken source.
  #[error("delivery for {key} carries unissued generation {generation}")]
  ReconciliationRace { key: QueryKey, generation: u64 },

  #[error("invalid configuration: {0}")]
  Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
