//! Error type for `laurel-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] laurel_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("bad column value: {0}")]
  BadColumn(String),
}

impl Error {
  /// Collapse into the engine taxonomy at the [`laurel_core::store::XpStore`]
  /// boundary. Domain errors pass through; backend faults become `Storage`.
  pub fn into_core(self) -> laurel_core::Error {
    match self {
      Self::Core(e) => e,
      other => laurel_core::Error::Storage(other.to_string()),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
