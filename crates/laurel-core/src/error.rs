//! Error taxonomy for `laurel-core`.
//!
//! Every variant maps to one [`ErrorClass`]; callers use the class to decide
//! whether a failed call may be retried. The engine itself never retries —
//! retry policy belongs entirely to the caller.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("validation error: {0}")]
  Validation(String),

  /// Transient contention on the per-user lock. Safe to retry with the same
  /// idempotency key.
  #[error("lock not acquired for user {0}")]
  LockNotAcquired(Uuid),

  /// The caller's assumed source version is stale relative to the registry.
  #[error("source version conflict: caller assumed v{expected}, registry has v{actual}")]
  ConflictMismatch { expected: u32, actual: u32 },

  #[error("xp source not found: {source_type}/{action_type}")]
  SourceNotFound {
    source_type: String,
    action_type: String,
  },

  #[error("achievement not found: {code} v{version}")]
  AchievementNotFound { code: String, version: u32 },

  #[error("source {source_type}/{action_type} is not repeatable")]
  NotRepeatable {
    source_type: String,
    action_type: String,
  },

  #[error("cooldown active until {until}")]
  CooldownActive { until: DateTime<Utc> },

  #[error("daily limit of {max_per_day} reached for {source_type}/{action_type}")]
  DailyLimitReached {
    source_type: String,
    action_type: String,
    max_per_day: u32,
  },

  /// The resulting balance would be negative. Fatal for that call.
  #[error("insufficient balance: {xp_before} + {xp_delta} would go negative")]
  InsufficientState { xp_before: i64, xp_delta: i64 },

  #[error("invalid level table: {0}")]
  InvalidLevelTable(String),

  #[error("definition already exists: {0}")]
  AlreadyDefined(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A fault in the storage backend, opaque to callers.
  #[error("storage error: {0}")]
  Storage(String),
}

/// Coarse classification used by callers for retry and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  Validation,
  LockContention,
  Conflict,
  NotFound,
  InsufficientState,
  Internal,
}

impl ErrorClass {
  /// Transient classes are expected to be retried by the caller with
  /// backoff, reusing the same idempotency key.
  pub fn is_retryable(self) -> bool {
    matches!(self, Self::LockContention | Self::Conflict)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Validation => "validation_error",
      Self::LockContention => "lock_not_acquired",
      Self::Conflict => "conflict_mismatch",
      Self::NotFound => "not_found",
      Self::InsufficientState => "insufficient_state",
      Self::Internal => "internal_error",
    }
  }
}

impl Error {
  pub fn class(&self) -> ErrorClass {
    match self {
      Self::Validation(_)
      | Self::NotRepeatable { .. }
      | Self::CooldownActive { .. }
      | Self::DailyLimitReached { .. }
      | Self::InvalidLevelTable(_)
      | Self::AlreadyDefined(_) => ErrorClass::Validation,
      Self::LockNotAcquired(_) => ErrorClass::LockContention,
      Self::ConflictMismatch { .. } => ErrorClass::Conflict,
      Self::SourceNotFound { .. } | Self::AchievementNotFound { .. } => {
        ErrorClass::NotFound
      }
      Self::InsufficientState { .. } => ErrorClass::InsufficientState,
      Self::Serialization(_) | Self::Storage(_) => ErrorClass::Internal,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
