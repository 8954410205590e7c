//! Error type for `docket-store-memory`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The fixture is not shaped `{ collection: { docId: document } }`.
  #[error("invalid fixture: {0}")]
  InvalidFixture(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
