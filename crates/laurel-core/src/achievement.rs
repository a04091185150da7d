//! Achievement grants and unlock types.
//!
//! A grant records that a user unlocked one version of an achievement.
//! Uniqueness is per (user, achievement, version, scope) for non-repeatable
//! definitions and per cooldown window otherwise; both are enforced by the
//! engine under the per-user lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result, registry::ProgressSnapshot};

// ─── UserAchievement ─────────────────────────────────────────────────────────

/// One unlocked achievement for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAchievement {
  pub ua_id:               Uuid,
  pub user_id:             Uuid,
  pub achievement_id:      Uuid,
  pub code:                String,
  pub achievement_version: u32,
  /// The ledger event that credited the reward. `None` for grants that
  /// predate the ledger, until `sync_achievement_xp` repairs them.
  pub event_id:            Option<Uuid>,
  pub xp_reward:           i64,
  /// Optional grouping (e.g. per course) partitioning repeatable
  /// eligibility.
  pub scope:               Option<String>,
  pub unlocked_at:         DateTime<Utc>,
  pub details:             serde_json::Value,
}

// ─── UnlockRequest ───────────────────────────────────────────────────────────

/// Input to [`crate::store::XpStore::unlock_achievement`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockRequest {
  pub user_id:         Uuid,
  pub code:            String,
  pub version:         u32,
  pub idempotency_key: String,
  pub scope:           Option<String>,
  pub reference_id:    Option<Uuid>,
  /// When present, the definition's condition is evaluated against it and
  /// an unmet condition rejects the unlock.
  pub progress:        Option<ProgressSnapshot>,
}

impl UnlockRequest {
  pub fn new(
    user_id: Uuid,
    code: impl Into<String>,
    version: u32,
    idempotency_key: impl Into<String>,
  ) -> Self {
    Self {
      user_id,
      code: code.into(),
      version,
      idempotency_key: idempotency_key.into(),
      scope: None,
      reference_id: None,
      progress: None,
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.idempotency_key.trim().is_empty() {
      return Err(Error::Validation("idempotency key must not be empty".into()));
    }
    if self.code.trim().is_empty() {
      return Err(Error::Validation(
        "achievement code must not be empty".into(),
      ));
    }
    Ok(())
  }
}

// ─── UnlockOutcome ───────────────────────────────────────────────────────────

/// Result of an unlock. A replay — same idempotency key, or a repeated
/// unlock of a held non-repeatable achievement — returns the prior grant
/// with `idempotent = true` and no new XP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockOutcome {
  pub ua_id:        Uuid,
  pub event_id:     Option<Uuid>,
  pub xp_before:    i64,
  pub xp_after:     i64,
  pub level_before: u32,
  pub level_after:  u32,
  pub idempotent:   bool,
}
