//! Compensation types — auditable reversal of previously granted XP.
//!
//! Compensation never edits or deletes existing ledger rows: every
//! correction is a new, negatively signed event with a deterministic
//! idempotency key, so re-running a compensation is itself idempotent and
//! can never double-revert.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Requests ────────────────────────────────────────────────────────────────

/// Input to [`crate::store::XpStore::compensate_achievement`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationRequest {
  pub code:            String,
  pub version:         u32,
  pub reason:          String,
  pub idempotency_key: String,
}

impl CompensationRequest {
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

// ─── Reports ─────────────────────────────────────────────────────────────────

/// Per-user outcome of a reversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCompensation {
  pub user_id:      Uuid,
  pub xp_removed:   i64,
  pub new_total_xp: i64,
  pub new_level:    u32,
}

/// Aggregate outcome of a bulk reversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationReport {
  pub affected_users:    u64,
  /// Attributable grant events scanned across all affected users.
  pub total_events:      u64,
  pub total_xp_reverted: i64,
  pub users:             Vec<UserCompensation>,
}

/// Outcome of [`crate::store::XpStore::sync_achievement_xp`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
  pub user_id:      Uuid,
  pub events_added: u64,
  pub xp_added:     i64,
  pub new_total_xp: i64,
  pub new_level:    u32,
}

// ─── Deterministic keys ──────────────────────────────────────────────────────

/// Per-user idempotency key for one bulk compensation run. The key is the
/// same for every affected user; uniqueness is per (user, key) in the
/// ledger, so a rerun replays instead of double-reverting.
pub fn compensation_key(code: &str, version: u32, base_key: &str) -> String {
  format!("compensate:{code}:v{version}:{base_key}")
}

/// Idempotency key for a single-user recalculation after a definition is
/// removed. `kind` is `"achievement"` or `"source"`.
pub fn removal_key(
  kind: &str,
  target: &str,
  version: Option<u32>,
  reason: &str,
) -> String {
  match version {
    Some(v) => format!("remove-{kind}:{target}:v{v}:{reason}"),
    None => format!("remove-{kind}:{target}:all:{reason}"),
  }
}

/// Idempotency key for backfilling the ledger event of a pre-ledger grant.
pub fn sync_key(ua_id: Uuid) -> String { format!("sync:{ua_id}") }
