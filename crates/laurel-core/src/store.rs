//! The `XpStore` trait and its contract.
//!
//! The trait is implemented by storage backends (e.g.
//! `laurel-store-sqlite`). The API layer depends on this abstraction, not on
//! any concrete backend.
//!
//! Every mutating operation takes a caller-supplied idempotency key and
//! executes as one transaction under the per-user lock: an identical key
//! yields an identical result with the effect applied at most once,
//! regardless of retries, network duplication, or double submission.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Error,
  achievement::{UnlockOutcome, UnlockRequest, UserAchievement},
  compensation::{CompensationReport, CompensationRequest, SyncReport, UserCompensation},
  event::{CreditOutcome, CreditRequest, UserProfile, XpEvent},
  level::LevelInfo,
  registry::{AchievementDefinition, NewAchievement, NewXpSource, XpSource},
};

/// Abstraction over an XP ledger backend.
///
/// The ledger is append-only: mutations append events, corrections append
/// compensating events, and the cached xp/level projection is updated in the
/// same transaction as the event that justifies it.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait XpStore: Send + Sync {
  // ── Registry ──────────────────────────────────────────────────────────

  /// Register a new (source_type, action_type, version) row. Existing
  /// versions are never overwritten; a duplicate is an error.
  fn define_xp_source(
    &self,
    input: NewXpSource,
  ) -> impl Future<Output = Result<XpSource, Error>> + Send + '_;

  /// Register a new (code, version) achievement row.
  fn define_achievement(
    &self,
    input: NewAchievement,
  ) -> impl Future<Output = Result<AchievementDefinition, Error>> + Send + '_;

  /// All sources within their effective window at `at` (default now).
  fn get_active_xp_sources(
    &self,
    at: Option<DateTime<Utc>>,
  ) -> impl Future<Output = Result<Vec<XpSource>, Error>> + Send + '_;

  /// Look up one achievement definition. Returns `None` if the exact
  /// (code, version) pair was never defined.
  fn get_achievement<'a>(
    &'a self,
    code: &'a str,
    version: u32,
  ) -> impl Future<Output = Result<Option<AchievementDefinition>, Error>> + Send + 'a;

  // ── Mutations ─────────────────────────────────────────────────────────

  /// Apply one signed XP delta to one user, exactly once per idempotency
  /// key. Setting `source_version` on the request makes this the `_safe`
  /// variant.
  fn credit_xp(
    &self,
    request: CreditRequest,
  ) -> impl Future<Output = Result<CreditOutcome, Error>> + Send + '_;

  /// Gate and grant an achievement, crediting its reward in the same
  /// transaction.
  fn unlock_achievement(
    &self,
    request: UnlockRequest,
  ) -> impl Future<Output = Result<UnlockOutcome, Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Pure level computation against the installed level table.
  fn level_info(
    &self,
    xp_total: i64,
  ) -> impl Future<Output = Result<LevelInfo, Error>> + Send + '_;

  /// The materialized xp/level projection. `None` if the user has no
  /// ledger history.
  fn get_profile(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<Option<UserProfile>, Error>> + Send + '_;

  /// The user's events, newest first.
  fn get_events(
    &self,
    user_id: Uuid,
    limit: Option<usize>,
    offset: Option<usize>,
  ) -> impl Future<Output = Result<Vec<XpEvent>, Error>> + Send + '_;

  fn get_user_achievements(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<Vec<UserAchievement>, Error>> + Send + '_;

  // ── Compensation ──────────────────────────────────────────────────────

  /// Bulk reversal of everything a (code, version) achievement granted,
  /// across all users. Re-runnable safely.
  fn compensate_achievement(
    &self,
    request: CompensationRequest,
  ) -> impl Future<Output = Result<CompensationReport, Error>> + Send + '_;

  /// Revert one user's XP attributable to a removed achievement
  /// (all versions when `version` is `None`).
  fn recalculate_user_xp_after_achievement_removal<'a>(
    &'a self,
    user_id: Uuid,
    code: &'a str,
    version: Option<u32>,
    reason: &'a str,
  ) -> impl Future<Output = Result<UserCompensation, Error>> + Send + 'a;

  /// Revert one user's XP attributable to a removed source.
  fn recalculate_user_xp_after_source_removal<'a>(
    &'a self,
    user_id: Uuid,
    source_type: &'a str,
    action_type: &'a str,
    version: Option<u32>,
    reason: &'a str,
  ) -> impl Future<Output = Result<UserCompensation, Error>> + Send + 'a;

  /// Backfill ledger events for grants that predate the ledger, bringing
  /// the projection and the event stream back into agreement.
  fn sync_achievement_xp(
    &self,
    user_id: Uuid,
  ) -> impl Future<Output = Result<SyncReport, Error>> + Send + '_;
}
