//! Ledger event types — the fundamental unit of the XP ledger.
//!
//! An event is an immutable record of one signed XP delta applied to one
//! user. Events are never updated or deleted; corrections are new
//! compensating events appended on top.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Source reference ────────────────────────────────────────────────────────

/// Reserved `source_type` for achievement grants. The event's `action_type`
/// carries the achievement code and `source_id` the definition id.
pub const SOURCE_TYPE_ACHIEVEMENT: &str = "achievement";

/// Reserved `source_type` for compensating (reversal) events. Never resolved
/// against the registry, and never counted when scanning for attributable
/// grants.
pub const SOURCE_TYPE_COMPENSATION: &str = "compensation";

/// Identifies what awarded (or reverted) XP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
  pub source_type: String,
  pub action_type: String,
}

impl SourceRef {
  pub fn new(
    source_type: impl Into<String>,
    action_type: impl Into<String>,
  ) -> Self {
    Self {
      source_type: source_type.into(),
      action_type: action_type.into(),
    }
  }

  /// A grant issued for unlocking the achievement `code`.
  pub fn achievement(code: impl Into<String>) -> Self {
    Self::new(SOURCE_TYPE_ACHIEVEMENT, code)
  }

  /// A reversal targeting previously granted XP for `target`.
  pub fn compensation(target: impl Into<String>) -> Self {
    Self::new(SOURCE_TYPE_COMPENSATION, target)
  }

  pub fn is_achievement(&self) -> bool {
    self.source_type == SOURCE_TYPE_ACHIEVEMENT
  }

  pub fn is_compensation(&self) -> bool {
    self.source_type == SOURCE_TYPE_COMPENSATION
  }
}

// ─── XpEvent ─────────────────────────────────────────────────────────────────

/// An immutable ledger row. Once written, no field is ever updated.
///
/// Invariants: `xp_after = xp_before + xp_delta`, `xp_after >= 0`, and at
/// most one row ever exists for a given (user_id, idempotency_key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpEvent {
  pub event_id:        Uuid,
  pub user_id:         Uuid,
  pub source_type:     String,
  pub source_id:       Option<Uuid>,
  pub action_type:     String,
  pub source_version:  Option<u32>,
  pub idempotency_key: String,
  pub reference_id:    Option<Uuid>,
  pub xp_delta:        i64,
  pub xp_before:       i64,
  pub xp_after:        i64,
  pub level_before:    u32,
  pub level_after:     u32,
  pub metadata:        serde_json::Value,
  /// Server-assigned timestamp; never changes after creation.
  pub created_at:      DateTime<Utc>,
}

// ─── CreditRequest ───────────────────────────────────────────────────────────

/// Input to [`crate::store::XpStore::credit_xp`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRequest {
  pub user_id:         Uuid,
  pub source:          SourceRef,
  pub xp_delta:        i64,
  pub idempotency_key: String,
  pub reference_id:    Option<Uuid>,
  /// When set, the registry's current version for the source must match or
  /// the call fails with `ConflictMismatch`. This is the `_safe` variant's
  /// optimistic concurrency check on the definition, independent of the
  /// per-user lock which protects the balance.
  pub source_version:  Option<u32>,
  pub metadata:        serde_json::Value,
}

impl CreditRequest {
  /// Convenience constructor with optional fields set to their defaults.
  pub fn new(
    user_id: Uuid,
    source: SourceRef,
    xp_delta: i64,
    idempotency_key: impl Into<String>,
  ) -> Self {
    Self {
      user_id,
      source,
      xp_delta,
      idempotency_key: idempotency_key.into(),
      reference_id: None,
      source_version: None,
      metadata: serde_json::Value::Object(Default::default()),
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.idempotency_key.trim().is_empty() {
      return Err(Error::Validation("idempotency key must not be empty".into()));
    }
    if self.source.source_type.trim().is_empty()
      || self.source.action_type.trim().is_empty()
    {
      return Err(Error::Validation(
        "source_type and action_type must not be empty".into(),
      ));
    }
    if self.source.is_compensation() && self.xp_delta > 0 {
      return Err(Error::Validation(
        "compensation deltas must not be positive".into(),
      ));
    }
    Ok(())
  }
}

// ─── CreditOutcome ───────────────────────────────────────────────────────────

/// Result of a credit. Identical idempotency key always yields an identical
/// outcome, with the mutating effect applied at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditOutcome {
  pub event_id:     Uuid,
  pub xp_before:    i64,
  pub xp_after:     i64,
  pub level_before: u32,
  pub level_after:  u32,
  /// `true` when this call replayed a previously committed event.
  pub idempotent:   bool,
}

// ─── UserProfile ─────────────────────────────────────────────────────────────

/// The materialized xp/level projection for one user. Written only in the
/// same transaction as the event that justifies the new value, so it always
/// equals the sum of the user's event deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
  pub user_id:    Uuid,
  pub xp:         i64,
  pub level:      u32,
  pub updated_at: DateTime<Utc>,
}
