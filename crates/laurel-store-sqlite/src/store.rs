//! [`SqliteStore`] — the SQLite implementation of [`XpStore`].
//!
//! Every mutating operation runs as one SQLite transaction inside one
//! [`tokio_rusqlite`] call, with the per-user lock guard held around it.
//! The guard is dropped as soon as the transaction ends; it is never held
//! across a response to the caller.

use std::{path::Path, sync::Arc};

use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use laurel_core::{
  achievement::{UnlockOutcome, UnlockRequest, UserAchievement},
  compensation::{
    CompensationReport, CompensationRequest, SyncReport, UserCompensation,
    compensation_key, removal_key, sync_key,
  },
  event::{
    CreditOutcome, CreditRequest, SOURCE_TYPE_ACHIEVEMENT, SourceRef,
    UserProfile, XpEvent,
  },
  level::{LevelDefinition, LevelInfo, LevelTable},
  registry::{
    AchievementDefinition, NewAchievement, NewXpSource, RepeatHistory,
    XpSource, check_achievement_repeat, check_repeat,
  },
  store::XpStore,
};

use crate::{
  Error, Result,
  encode::{
    RawAchievement, RawProfile, RawUserAchievement, RawXpEvent, RawXpSource,
    encode_dt, encode_uuid,
  },
  lock::LockManager,
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// An XP ledger backed by a single SQLite file.
///
/// Cloning is cheap — the connection is reference-counted and clones share
/// the lock manager, so cloned handles still contend on the same per-user
/// keys.
#[derive(Clone)]
pub struct SqliteStore {
  conn:   tokio_rusqlite::Connection,
  levels: Arc<LevelTable>,
  locks:  LockManager,
}

impl SqliteStore {
  /// Open (or create) a store at `path`, run schema initialisation, and
  /// seed the builtin level table if none is installed.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn =
      tokio_rusqlite::Connection::open(path.as_ref().to_owned()).await?;
    Self::init(conn).await
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;

    let installed: Vec<LevelDefinition> =
      conn.call(|conn| Ok(load_levels(conn))).await??;

    let levels = if installed.is_empty() {
      let builtin = LevelTable::builtin();
      let rows = builtin.levels().to_vec();
      conn.call(move |conn| Ok(seed_levels(conn, &rows))).await??;
      builtin
    } else {
      LevelTable::new(installed).map_err(Error::Core)?
    };

    Ok(Self {
      conn,
      levels: Arc::new(levels),
      locks: LockManager::new(),
    })
  }

  /// Test-only access to the raw connection.
  #[cfg(test)]
  pub(crate) fn raw(&self) -> &tokio_rusqlite::Connection { &self.conn }

  // ── Inner implementations ─────────────────────────────────────────────

  async fn define_xp_source_inner(
    &self,
    input: NewXpSource,
  ) -> Result<XpSource> {
    let source = XpSource {
      source_id:        Uuid::new_v4(),
      source_type:      input.source_type,
      action_type:      input.action_type,
      version:          input.version,
      xp_value:         input.xp_value,
      is_repeatable:    input.is_repeatable,
      cooldown_minutes: input.cooldown_minutes,
      max_per_day:      input.max_per_day,
      effective_from:   input.effective_from,
      effective_to:     input.effective_to,
      is_active:        true,
      created_at:       Utc::now(),
    };

    let row = source.clone();
    self
      .conn
      .call(move |conn| Ok(insert_source(conn, &row)))
      .await??;
    Ok(source)
  }

  async fn define_achievement_inner(
    &self,
    input: NewAchievement,
  ) -> Result<AchievementDefinition> {
    let definition = AchievementDefinition {
      achievement_id: Uuid::new_v4(),
      code:           input.code,
      version:        input.version,
      condition:      input.condition,
      xp_reward:      input.xp_reward,
      is_repeatable:  input.is_repeatable,
      cooldown_hours: input.cooldown_hours,
      effective_from: input.effective_from,
      effective_to:   input.effective_to,
      is_active:      true,
      created_at:     Utc::now(),
    };

    let row = definition.clone();
    self
      .conn
      .call(move |conn| Ok(insert_achievement(conn, &row)))
      .await??;
    Ok(definition)
  }

  async fn get_active_xp_sources_inner(
    &self,
    at: Option<DateTime<Utc>>,
  ) -> Result<Vec<XpSource>> {
    let at = at.unwrap_or_else(Utc::now);
    let sources: Vec<XpSource> =
      self.conn.call(|conn| Ok(list_sources(conn))).await??;
    Ok(
      sources
        .into_iter()
        .filter(|s| s.is_effective_at(at))
        .collect(),
    )
  }

  async fn get_achievement_inner(
    &self,
    code: String,
    version: u32,
  ) -> Result<Option<AchievementDefinition>> {
    self
      .conn
      .call(move |conn| Ok(find_achievement(conn, &code, version)))
      .await?
  }

  async fn credit_inner(
    &self,
    request: CreditRequest,
  ) -> Result<CreditOutcome> {
    request.validate().map_err(Error::Core)?;

    let _guard = self
      .locks
      .try_acquire(request.user_id, request.reference_id)
      .ok_or(laurel_core::Error::LockNotAcquired(request.user_id))?;

    let levels = Arc::clone(&self.levels);
    let now = Utc::now();
    let outcome = self
      .conn
      .call(move |conn| Ok(credit_tx(conn, &levels, &request, now)))
      .await??;
    Ok(outcome)
  }

  async fn unlock_inner(
    &self,
    request: UnlockRequest,
  ) -> Result<UnlockOutcome> {
    request.validate().map_err(Error::Core)?;

    // Grant gating must serialize per user regardless of lesson scope.
    let _guard = self
      .locks
      .try_acquire(request.user_id, None)
      .ok_or(laurel_core::Error::LockNotAcquired(request.user_id))?;

    let levels = Arc::clone(&self.levels);
    let now = Utc::now();
    let outcome = self
      .conn
      .call(move |conn| Ok(unlock_tx(conn, &levels, &request, now)))
      .await??;
    Ok(outcome)
  }

  async fn get_profile_inner(
    &self,
    user_id: Uuid,
  ) -> Result<Option<UserProfile>> {
    self
      .conn
      .call(move |conn| Ok(find_profile(conn, user_id)))
      .await?
  }

  async fn get_events_inner(
    &self,
    user_id: Uuid,
    limit: Option<usize>,
    offset: Option<usize>,
  ) -> Result<Vec<XpEvent>> {
    let limit = limit.unwrap_or(100) as i64;
    let offset = offset.unwrap_or(0) as i64;
    self
      .conn
      .call(move |conn| Ok(list_events(conn, user_id, limit, offset)))
      .await?
  }

  async fn get_user_achievements_inner(
    &self,
    user_id: Uuid,
  ) -> Result<Vec<UserAchievement>> {
    self
      .conn
      .call(move |conn| Ok(list_grants(conn, user_id)))
      .await?
  }

  async fn compensate_inner(
    &self,
    request: CompensationRequest,
  ) -> Result<CompensationReport> {
    request.validate().map_err(Error::Core)?;

    let code = request.code.clone();
    let version = request.version;
    let totals: Vec<AttributableTotal> = self
      .conn
      .call(move |conn| {
        Ok(attributable_totals(
          conn,
          SOURCE_TYPE_ACHIEVEMENT,
          &code,
          Some(version),
        ))
      })
      .await??;

    let key =
      compensation_key(&request.code, request.version, &request.idempotency_key);

    let mut users = Vec::new();
    let mut total_events = 0u64;
    let mut total_reverted = 0i64;

    for total in totals {
      total_events += total.events;
      if total.xp_granted <= 0 {
        continue;
      }

      let outcome = self
        .credit_inner(CreditRequest {
          user_id:         total.user_id,
          source:          SourceRef::compensation(&request.code),
          xp_delta:        -total.xp_granted,
          idempotency_key: key.clone(),
          reference_id:    None,
          source_version:  Some(request.version),
          metadata:        serde_json::json!({
            "reason": request.reason,
            "code": request.code,
            "version": request.version,
          }),
        })
        .await?;

      // On replay the stored event carries the original revert, so the
      // report stays identical across reruns.
      let xp_removed = outcome.xp_before - outcome.xp_after;
      total_reverted += xp_removed;
      users.push(UserCompensation {
        user_id:      total.user_id,
        xp_removed,
        new_total_xp: outcome.xp_after,
        new_level:    outcome.level_after,
      });
    }

    tracing::info!(
      code = %request.code,
      version = request.version,
      affected_users = users.len(),
      total_xp_reverted = total_reverted,
      "achievement compensated"
    );

    Ok(CompensationReport {
      affected_users: users.len() as u64,
      total_events,
      total_xp_reverted: total_reverted,
      users,
    })
  }

  async fn recalc_after_achievement_removal_inner(
    &self,
    user_id: Uuid,
    code: String,
    version: Option<u32>,
    reason: String,
  ) -> Result<UserCompensation> {
    let target = code.clone();
    let sum: i64 = self
      .conn
      .call(move |conn| {
        Ok(user_attributable_sum(
          conn,
          user_id,
          SOURCE_TYPE_ACHIEVEMENT,
          &target,
          version,
        ))
      })
      .await??;

    self
      .revert_for_user(
        user_id,
        SourceRef::compensation(&code),
        sum,
        removal_key("achievement", &code, version, &reason),
        version,
        serde_json::json!({ "reason": reason, "code": code }),
      )
      .await
  }

  async fn recalc_after_source_removal_inner(
    &self,
    user_id: Uuid,
    source_type: String,
    action_type: String,
    version: Option<u32>,
    reason: String,
  ) -> Result<UserCompensation> {
    let (st, at) = (source_type.clone(), action_type.clone());
    let sum: i64 = self
      .conn
      .call(move |conn| {
        Ok(user_attributable_sum(conn, user_id, &st, &at, version))
      })
      .await??;

    let target = format!("{source_type}/{action_type}");
    self
      .revert_for_user(
        user_id,
        SourceRef::compensation(&target),
        sum,
        removal_key("source", &target, version, &reason),
        version,
        serde_json::json!({
          "reason": reason,
          "source_type": source_type,
          "action_type": action_type,
        }),
      )
      .await
  }

  /// Append one compensating event for `user_id`, or report the user's
  /// current standing unchanged when there is nothing to revert.
  async fn revert_for_user(
    &self,
    user_id: Uuid,
    source: SourceRef,
    xp_to_revert: i64,
    idempotency_key: String,
    source_version: Option<u32>,
    metadata: serde_json::Value,
  ) -> Result<UserCompensation> {
    if xp_to_revert <= 0 {
      let profile = self.get_profile_inner(user_id).await?;
      let (xp, level) = match profile {
        Some(p) => (p.xp, p.level),
        None => (0, self.levels.level_info(0).level),
      };
      return Ok(UserCompensation {
        user_id,
        xp_removed: 0,
        new_total_xp: xp,
        new_level: level,
      });
    }

    let outcome = self
      .credit_inner(CreditRequest {
        user_id,
        source,
        xp_delta: -xp_to_revert,
        idempotency_key,
        reference_id: None,
        source_version,
        metadata,
      })
      .await?;

    Ok(UserCompensation {
      user_id,
      xp_removed:   outcome.xp_before - outcome.xp_after,
      new_total_xp: outcome.xp_after,
      new_level:    outcome.level_after,
    })
  }

  async fn sync_inner(&self, user_id: Uuid) -> Result<SyncReport> {
    let _guard = self
      .locks
      .try_acquire(user_id, None)
      .ok_or(laurel_core::Error::LockNotAcquired(user_id))?;

    let levels = Arc::clone(&self.levels);
    let now = Utc::now();
    let report = self
      .conn
      .call(move |conn| Ok(sync_tx(conn, &levels, user_id, now)))
      .await??;

    tracing::info!(
      user_id = %user_id,
      events_added = report.events_added,
      xp_added = report.xp_added,
      "achievement xp synced"
    );
    Ok(report)
  }
}

// ─── XpStore impl ────────────────────────────────────────────────────────────

impl XpStore for SqliteStore {
  async fn define_xp_source(
    &self,
    input: NewXpSource,
  ) -> Result<XpSource, laurel_core::Error> {
    self
      .define_xp_source_inner(input)
      .await
      .map_err(Error::into_core)
  }

  async fn define_achievement(
    &self,
    input: NewAchievement,
  ) -> Result<AchievementDefinition, laurel_core::Error> {
    self
      .define_achievement_inner(input)
      .await
      .map_err(Error::into_core)
  }

  async fn get_active_xp_sources(
    &self,
    at: Option<DateTime<Utc>>,
  ) -> Result<Vec<XpSource>, laurel_core::Error> {
    self
      .get_active_xp_sources_inner(at)
      .await
      .map_err(Error::into_core)
  }

  async fn get_achievement(
    &self,
    code: &str,
    version: u32,
  ) -> Result<Option<AchievementDefinition>, laurel_core::Error> {
    self
      .get_achievement_inner(code.to_owned(), version)
      .await
      .map_err(Error::into_core)
  }

  async fn credit_xp(
    &self,
    request: CreditRequest,
  ) -> Result<CreditOutcome, laurel_core::Error> {
    self.credit_inner(request).await.map_err(Error::into_core)
  }

  async fn unlock_achievement(
    &self,
    request: UnlockRequest,
  ) -> Result<UnlockOutcome, laurel_core::Error> {
    self.unlock_inner(request).await.map_err(Error::into_core)
  }

  async fn level_info(
    &self,
    xp_total: i64,
  ) -> Result<LevelInfo, laurel_core::Error> {
    Ok(self.levels.level_info(xp_total))
  }

  async fn get_profile(
    &self,
    user_id: Uuid,
  ) -> Result<Option<UserProfile>, laurel_core::Error> {
    self
      .get_profile_inner(user_id)
      .await
      .map_err(Error::into_core)
  }

  async fn get_events(
    &self,
    user_id: Uuid,
    limit: Option<usize>,
    offset: Option<usize>,
  ) -> Result<Vec<XpEvent>, laurel_core::Error> {
    self
      .get_events_inner(user_id, limit, offset)
      .await
      .map_err(Error::into_core)
  }

  async fn get_user_achievements(
    &self,
    user_id: Uuid,
  ) -> Result<Vec<UserAchievement>, laurel_core::Error> {
    self
      .get_user_achievements_inner(user_id)
      .await
      .map_err(Error::into_core)
  }

  async fn compensate_achievement(
    &self,
    request: CompensationRequest,
  ) -> Result<CompensationReport, laurel_core::Error> {
    self
      .compensate_inner(request)
      .await
      .map_err(Error::into_core)
  }

  async fn recalculate_user_xp_after_achievement_removal(
    &self,
    user_id: Uuid,
    code: &str,
    version: Option<u32>,
    reason: &str,
  ) -> Result<UserCompensation, laurel_core::Error> {
    self
      .recalc_after_achievement_removal_inner(
        user_id,
        code.to_owned(),
        version,
        reason.to_owned(),
      )
      .await
      .map_err(Error::into_core)
  }

  async fn recalculate_user_xp_after_source_removal(
    &self,
    user_id: Uuid,
    source_type: &str,
    action_type: &str,
    version: Option<u32>,
    reason: &str,
  ) -> Result<UserCompensation, laurel_core::Error> {
    self
      .recalc_after_source_removal_inner(
        user_id,
        source_type.to_owned(),
        action_type.to_owned(),
        version,
        reason.to_owned(),
      )
      .await
      .map_err(Error::into_core)
  }

  async fn sync_achievement_xp(
    &self,
    user_id: Uuid,
  ) -> Result<SyncReport, laurel_core::Error> {
    self.sync_inner(user_id).await.map_err(Error::into_core)
  }
}

// ─── Transaction bodies ──────────────────────────────────────────────────────

/// Everything needed to append one ledger row, with the source already
/// resolved.
struct EventSpec {
  user_id:         Uuid,
  source_type:     String,
  source_id:       Option<Uuid>,
  action_type:     String,
  source_version:  Option<u32>,
  idempotency_key: String,
  reference_id:    Option<Uuid>,
  xp_delta:        i64,
  metadata:        serde_json::Value,
}

fn credit_tx(
  conn: &mut rusqlite::Connection,
  levels: &LevelTable,
  request: &CreditRequest,
  now: DateTime<Utc>,
) -> Result<CreditOutcome> {
  let tx = conn.transaction()?;

  // Exactly-once: a retried call replays the stored result unchanged,
  // before any registry validation — the source may have been deactivated
  // since the original attempt committed.
  if let Some(prior) =
    find_event_by_key(&tx, request.user_id, &request.idempotency_key)?
  {
    return Ok(replay_outcome(&prior));
  }

  let resolved = resolve_and_check(&tx, request, now)?;

  let spec = EventSpec {
    user_id:         request.user_id,
    source_type:     request.source.source_type.clone(),
    source_id:       resolved.source_id,
    action_type:     request.source.action_type.clone(),
    source_version:  resolved.version,
    idempotency_key: request.idempotency_key.clone(),
    reference_id:    request.reference_id,
    xp_delta:        request.xp_delta,
    metadata:        request.metadata.clone(),
  };
  let outcome = apply_credit(&tx, levels, &spec, now)?;
  tx.commit()?;

  tracing::debug!(
    user_id = %request.user_id,
    source = %request.source.source_type,
    action = %request.source.action_type,
    delta = request.xp_delta,
    xp_after = outcome.xp_after,
    "xp credited"
  );
  Ok(outcome)
}

fn unlock_tx(
  conn: &mut rusqlite::Connection,
  levels: &LevelTable,
  request: &UnlockRequest,
  now: DateTime<Utc>,
) -> Result<UnlockOutcome> {
  let tx = conn.transaction()?;

  // Replay: the original attempt committed.
  if let Some(prior) =
    find_event_by_key(&tx, request.user_id, &request.idempotency_key)?
  {
    // The key exists but belongs to a non-unlock event: caller misuse.
    let grant = find_grant_by_event(&tx, prior.event_id)?.ok_or_else(|| {
      laurel_core::Error::Validation(format!(
        "idempotency key {} was already used by a non-unlock operation",
        request.idempotency_key
      ))
    })?;
    return Ok(UnlockOutcome {
      ua_id:        grant.ua_id,
      event_id:     Some(prior.event_id),
      xp_before:    prior.xp_before,
      xp_after:     prior.xp_after,
      level_before: prior.level_before,
      level_after:  prior.level_after,
      idempotent:   true,
    });
  }

  let definition = find_achievement(&tx, &request.code, request.version)?
    .ok_or_else(|| laurel_core::Error::AchievementNotFound {
      code:    request.code.clone(),
      version: request.version,
    })?;

  // The caller's definition is stale relative to the registry.
  if let Some(latest) = latest_achievement_version(&tx, &request.code)?
    && latest != definition.version
  {
    return Err(
      laurel_core::Error::ConflictMismatch {
        expected: request.version,
        actual:   latest,
      }
      .into(),
    );
  }

  // Outside the effective window counts as not found.
  if !definition.is_effective_at(now) {
    return Err(
      laurel_core::Error::AchievementNotFound {
        code:    request.code.clone(),
        version: request.version,
      }
      .into(),
    );
  }

  if let Some(progress) = &request.progress
    && !definition.condition.evaluate(progress)
  {
    return Err(
      laurel_core::Error::Validation(format!(
        "condition for achievement {} not met",
        request.code
      ))
      .into(),
    );
  }

  if let Some(existing) = latest_grant(
    &tx,
    request.user_id,
    definition.achievement_id,
    request.scope.as_deref(),
  )? {
    if !definition.is_repeatable {
      // Terminal already-granted state: success, no new XP.
      let xp = profile_xp(&tx, request.user_id)?;
      let info = levels.level_info(xp);
      return Ok(UnlockOutcome {
        ua_id:        existing.ua_id,
        event_id:     existing.event_id,
        xp_before:    xp,
        xp_after:     xp,
        level_before: info.level,
        level_after:  info.level,
        idempotent:   true,
      });
    }
    if let Some(cooldown) = definition.cooldown() {
      let until = existing.unlocked_at + cooldown;
      if now < until {
        return Err(laurel_core::Error::CooldownActive { until }.into());
      }
    }
  }

  let metadata = match &request.scope {
    Some(scope) => serde_json::json!({ "scope": scope }),
    None => serde_json::json!({}),
  };
  let spec = EventSpec {
    user_id:         request.user_id,
    source_type:     SOURCE_TYPE_ACHIEVEMENT.to_owned(),
    source_id:       Some(definition.achievement_id),
    action_type:     request.code.clone(),
    source_version:  Some(definition.version),
    idempotency_key: request.idempotency_key.clone(),
    reference_id:    request.reference_id,
    xp_delta:        definition.xp_reward,
    metadata,
  };
  let credited = apply_credit(&tx, levels, &spec, now)?;

  let grant = UserAchievement {
    ua_id:               Uuid::new_v4(),
    user_id:             request.user_id,
    achievement_id:      definition.achievement_id,
    code:                request.code.clone(),
    achievement_version: definition.version,
    event_id:            Some(credited.event_id),
    xp_reward:           definition.xp_reward,
    scope:               request.scope.clone(),
    unlocked_at:         now,
    details:             serde_json::json!({}),
  };
  insert_grant(&tx, &grant)?;
  tx.commit()?;

  tracing::info!(
    user_id = %request.user_id,
    code = %request.code,
    version = definition.version,
    xp_reward = definition.xp_reward,
    "achievement unlocked"
  );

  Ok(UnlockOutcome {
    ua_id:        grant.ua_id,
    event_id:     Some(credited.event_id),
    xp_before:    credited.xp_before,
    xp_after:     credited.xp_after,
    level_before: credited.level_before,
    level_after:  credited.level_after,
    idempotent:   false,
  })
}

fn sync_tx(
  conn: &mut rusqlite::Connection,
  levels: &LevelTable,
  user_id: Uuid,
  now: DateTime<Utc>,
) -> Result<SyncReport> {
  let tx = conn.transaction()?;

  let pending = unsynced_grants(&tx, user_id)?;
  let mut events_added = 0u64;
  let mut xp_added = 0i64;

  for grant in &pending {
    let key = sync_key(grant.ua_id);

    // A prior sync may have appended the event without linking it.
    let (event_id, added) = match find_event_by_key(&tx, user_id, &key)? {
      Some(prior) => (prior.event_id, false),
      None => {
        let spec = EventSpec {
          user_id,
          source_type:     SOURCE_TYPE_ACHIEVEMENT.to_owned(),
          source_id:       Some(grant.achievement_id),
          action_type:     grant.code.clone(),
          source_version:  Some(grant.achievement_version),
          idempotency_key: key,
          reference_id:    None,
          xp_delta:        grant.xp_reward,
          metadata:        serde_json::json!({ "sync": true }),
        };
        (apply_credit(&tx, levels, &spec, now)?.event_id, true)
      }
    };

    if added {
      events_added += 1;
      xp_added += grant.xp_reward;
    }
    link_grant_event(&tx, grant.ua_id, event_id)?;
  }

  let xp = profile_xp(&tx, user_id)?;
  let level = levels.level_info(xp).level;
  tx.commit()?;

  Ok(SyncReport {
    user_id,
    events_added,
    xp_added,
    new_total_xp: xp,
    new_level: level,
  })
}

/// What the registry resolved the request's source to.
struct ResolvedSource {
  source_id: Option<Uuid>,
  version:   Option<u32>,
}

/// Resolve the source reference and enforce effective-window, version, and
/// repeatability rules. Negative (compensating) deltas skip the window and
/// repeat checks: the source only has to be historically valid.
fn resolve_and_check(
  tx: &rusqlite::Transaction,
  request: &CreditRequest,
  now: DateTime<Utc>,
) -> Result<ResolvedSource> {
  if request.source.is_compensation() {
    return Ok(ResolvedSource {
      source_id: None,
      version:   request.source_version,
    });
  }

  let compensating = request.xp_delta < 0;

  if request.source.is_achievement() {
    let code = &request.source.action_type;
    let definition = latest_achievement(tx, code)?.ok_or_else(|| {
      laurel_core::Error::AchievementNotFound {
        code:    code.clone(),
        version: request.source_version.unwrap_or(0),
      }
    })?;
    if let Some(expected) = request.source_version
      && expected != definition.version
    {
      return Err(
        laurel_core::Error::ConflictMismatch {
          expected,
          actual: definition.version,
        }
        .into(),
      );
    }
    if !compensating {
      if !definition.is_effective_at(now) {
        return Err(
          laurel_core::Error::AchievementNotFound {
            code:    code.clone(),
            version: definition.version,
          }
          .into(),
        );
      }
      // Direct credits naming an achievement obey the same repeat rules
      // as grants; prior grant events count against both paths.
      let history = repeat_history(
        tx,
        request.user_id,
        &request.source,
        request.reference_id,
        now,
      )?;
      check_achievement_repeat(&definition, &history, now)
        .map_err(Error::Core)?;
    }
    return Ok(ResolvedSource {
      source_id: Some(definition.achievement_id),
      version:   Some(definition.version),
    });
  }

  let source = latest_source(tx, &request.source)?.ok_or_else(|| {
    laurel_core::Error::SourceNotFound {
      source_type: request.source.source_type.clone(),
      action_type: request.source.action_type.clone(),
    }
  })?;

  if let Some(expected) = request.source_version
    && expected != source.version
  {
    return Err(
      laurel_core::Error::ConflictMismatch {
        expected,
        actual: source.version,
      }
      .into(),
    );
  }

  if !compensating {
    if !source.is_effective_at(now) {
      return Err(
        laurel_core::Error::SourceNotFound {
          source_type: source.source_type,
          action_type: source.action_type,
        }
        .into(),
      );
    }
    let history = repeat_history(
      tx,
      request.user_id,
      &request.source,
      request.reference_id,
      now,
    )?;
    check_repeat(&source, &history, now).map_err(Error::Core)?;
  }

  Ok(ResolvedSource {
    source_id: Some(source.source_id),
    version:   Some(source.version),
  })
}

/// Balance math, level recomputation, event append, and projection update.
/// Callers have already handled idempotent replay and source validation.
fn apply_credit(
  tx: &rusqlite::Transaction,
  levels: &LevelTable,
  spec: &EventSpec,
  now: DateTime<Utc>,
) -> Result<CreditOutcome> {
  let xp_before = profile_xp(tx, spec.user_id)?;
  let xp_after = xp_before + spec.xp_delta;
  if xp_after < 0 {
    return Err(
      laurel_core::Error::InsufficientState {
        xp_before,
        xp_delta: spec.xp_delta,
      }
      .into(),
    );
  }

  let level_before = levels.level_info(xp_before).level;
  let level_after = levels.level_info(xp_after).level;

  let event = XpEvent {
    event_id: Uuid::new_v4(),
    user_id: spec.user_id,
    source_type: spec.source_type.clone(),
    source_id: spec.source_id,
    action_type: spec.action_type.clone(),
    source_version: spec.source_version,
    idempotency_key: spec.idempotency_key.clone(),
    reference_id: spec.reference_id,
    xp_delta: spec.xp_delta,
    xp_before,
    xp_after,
    level_before,
    level_after,
    metadata: spec.metadata.clone(),
    created_at: now,
  };
  insert_event(tx, &event)?;
  upsert_profile(tx, spec.user_id, xp_after, level_after, now)?;

  Ok(CreditOutcome {
    event_id: event.event_id,
    xp_before,
    xp_after,
    level_before,
    level_after,
    idempotent: false,
  })
}

fn replay_outcome(prior: &XpEvent) -> CreditOutcome {
  CreditOutcome {
    event_id:     prior.event_id,
    xp_before:    prior.xp_before,
    xp_after:     prior.xp_after,
    level_before: prior.level_before,
    level_after:  prior.level_after,
    idempotent:   true,
  }
}

// ─── SQL helpers ─────────────────────────────────────────────────────────────

const EVENT_COLS: &str = "event_id, user_id, source_type, source_id, \
                          action_type, source_version, idempotency_key, \
                          reference_id, xp_delta, xp_before, xp_after, \
                          level_before, level_after, metadata, created_at";

fn event_from_row(row: &rusqlite::Row) -> rusqlite::Result<RawXpEvent> {
  Ok(RawXpEvent {
    event_id:        row.get(0)?,
    user_id:         row.get(1)?,
    source_type:     row.get(2)?,
    source_id:       row.get(3)?,
    action_type:     row.get(4)?,
    source_version:  row.get(5)?,
    idempotency_key: row.get(6)?,
    reference_id:    row.get(7)?,
    xp_delta:        row.get(8)?,
    xp_before:       row.get(9)?,
    xp_after:        row.get(10)?,
    level_before:    row.get(11)?,
    level_after:     row.get(12)?,
    metadata:        row.get(13)?,
    created_at:      row.get(14)?,
  })
}

fn find_event_by_key(
  conn: &rusqlite::Connection,
  user_id: Uuid,
  idempotency_key: &str,
) -> Result<Option<XpEvent>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {EVENT_COLS} FROM xp_events
         WHERE user_id = ?1 AND idempotency_key = ?2"
      ),
      rusqlite::params![encode_uuid(user_id), idempotency_key],
      event_from_row,
    )
    .optional()?;
  raw.map(RawXpEvent::into_event).transpose()
}

fn insert_event(conn: &rusqlite::Connection, event: &XpEvent) -> Result<()> {
  conn.execute(
    "INSERT INTO xp_events (
       event_id, user_id, source_type, source_id, action_type,
       source_version, idempotency_key, reference_id,
       xp_delta, xp_before, xp_after, level_before, level_after,
       metadata, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    rusqlite::params![
      encode_uuid(event.event_id),
      encode_uuid(event.user_id),
      event.source_type,
      event.source_id.map(encode_uuid),
      event.action_type,
      event.source_version,
      event.idempotency_key,
      event.reference_id.map(encode_uuid),
      event.xp_delta,
      event.xp_before,
      event.xp_after,
      event.level_before,
      event.level_after,
      event.metadata.to_string(),
      encode_dt(event.created_at),
    ],
  )?;
  Ok(())
}

fn list_events(
  conn: &rusqlite::Connection,
  user_id: Uuid,
  limit: i64,
  offset: i64,
) -> Result<Vec<XpEvent>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {EVENT_COLS} FROM xp_events
     WHERE user_id = ?1
     ORDER BY created_at DESC, event_id DESC
     LIMIT ?2 OFFSET ?3"
  ))?;
  let raws = stmt
    .query_map(
      rusqlite::params![encode_uuid(user_id), limit, offset],
      event_from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawXpEvent::into_event).collect()
}

fn profile_xp(conn: &rusqlite::Connection, user_id: Uuid) -> Result<i64> {
  let xp: Option<i64> = conn
    .query_row(
      "SELECT xp FROM user_profiles WHERE user_id = ?1",
      rusqlite::params![encode_uuid(user_id)],
      |row| row.get(0),
    )
    .optional()?;
  Ok(xp.unwrap_or(0))
}

fn find_profile(
  conn: &rusqlite::Connection,
  user_id: Uuid,
) -> Result<Option<UserProfile>> {
  let raw = conn
    .query_row(
      "SELECT user_id, xp, level, updated_at
       FROM user_profiles WHERE user_id = ?1",
      rusqlite::params![encode_uuid(user_id)],
      |row| {
        Ok(RawProfile {
          user_id:    row.get(0)?,
          xp:         row.get(1)?,
          level:      row.get(2)?,
          updated_at: row.get(3)?,
        })
      },
    )
    .optional()?;
  raw.map(RawProfile::into_profile).transpose()
}

fn upsert_profile(
  conn: &rusqlite::Connection,
  user_id: Uuid,
  xp: i64,
  level: u32,
  now: DateTime<Utc>,
) -> Result<()> {
  conn.execute(
    "INSERT INTO user_profiles (user_id, xp, level, updated_at)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(user_id) DO UPDATE SET
       xp = excluded.xp,
       level = excluded.level,
       updated_at = excluded.updated_at",
    rusqlite::params![encode_uuid(user_id), xp, level, encode_dt(now)],
  )?;
  Ok(())
}

const SOURCE_COLS: &str = "source_id, source_type, action_type, version, \
                           xp_value, is_repeatable, cooldown_minutes, \
                           max_per_day, effective_from, effective_to, \
                           is_active, created_at";

fn source_from_row(row: &rusqlite::Row) -> rusqlite::Result<RawXpSource> {
  Ok(RawXpSource {
    source_id:        row.get(0)?,
    source_type:      row.get(1)?,
    action_type:      row.get(2)?,
    version:          row.get(3)?,
    xp_value:         row.get(4)?,
    is_repeatable:    row.get(5)?,
    cooldown_minutes: row.get(6)?,
    max_per_day:      row.get(7)?,
    effective_from:   row.get(8)?,
    effective_to:     row.get(9)?,
    is_active:        row.get(10)?,
    created_at:       row.get(11)?,
  })
}

fn insert_source(
  conn: &rusqlite::Connection,
  source: &XpSource,
) -> Result<()> {
  let exists: bool = conn
    .query_row(
      "SELECT 1 FROM xp_sources
       WHERE source_type = ?1 AND action_type = ?2 AND version = ?3",
      rusqlite::params![
        source.source_type,
        source.action_type,
        source.version
      ],
      |_| Ok(true),
    )
    .optional()?
    .unwrap_or(false);
  if exists {
    return Err(
      laurel_core::Error::AlreadyDefined(format!(
        "xp source {}/{} v{}",
        source.source_type, source.action_type, source.version
      ))
      .into(),
    );
  }

  conn.execute(
    "INSERT INTO xp_sources (
       source_id, source_type, action_type, version, xp_value,
       is_repeatable, cooldown_minutes, max_per_day,
       effective_from, effective_to, is_active, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    rusqlite::params![
      encode_uuid(source.source_id),
      source.source_type,
      source.action_type,
      source.version,
      source.xp_value,
      source.is_repeatable,
      source.cooldown_minutes,
      source.max_per_day,
      source.effective_from.map(encode_dt),
      source.effective_to.map(encode_dt),
      source.is_active,
      encode_dt(source.created_at),
    ],
  )?;
  Ok(())
}

fn list_sources(conn: &rusqlite::Connection) -> Result<Vec<XpSource>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {SOURCE_COLS} FROM xp_sources
     ORDER BY source_type, action_type, version"
  ))?;
  let raws = stmt
    .query_map([], source_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawXpSource::into_source).collect()
}

/// The highest-version row for a (source_type, action_type).
fn latest_source(
  conn: &rusqlite::Connection,
  source: &SourceRef,
) -> Result<Option<XpSource>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {SOURCE_COLS} FROM xp_sources
         WHERE source_type = ?1 AND action_type = ?2
         ORDER BY version DESC LIMIT 1"
      ),
      rusqlite::params![source.source_type, source.action_type],
      source_from_row,
    )
    .optional()?;
  raw.map(RawXpSource::into_source).transpose()
}

fn repeat_history(
  conn: &rusqlite::Connection,
  user_id: Uuid,
  source: &SourceRef,
  reference_id: Option<Uuid>,
  now: DateTime<Utc>,
) -> Result<RepeatHistory> {
  let user = encode_uuid(user_id);
  let reference = reference_id.map(encode_uuid);

  let (count, last): (i64, Option<String>) = conn.query_row(
    "SELECT COUNT(*), MAX(created_at) FROM xp_events
     WHERE user_id = ?1 AND source_type = ?2 AND action_type = ?3
       AND xp_delta > 0
       AND (?4 IS NULL OR reference_id = ?4)",
    rusqlite::params![user, source.source_type, source.action_type, reference],
    |row| Ok((row.get(0)?, row.get(1)?)),
  )?;

  let day_start = encode_dt(now.date_naive().and_time(NaiveTime::MIN).and_utc());
  let count_today: i64 = conn.query_row(
    "SELECT COUNT(*) FROM xp_events
     WHERE user_id = ?1 AND source_type = ?2 AND action_type = ?3
       AND xp_delta > 0 AND created_at >= ?4",
    rusqlite::params![user, source.source_type, source.action_type, day_start],
    |row| row.get(0),
  )?;

  let last_applied_at = match last {
    Some(s) => Some(crate::encode::decode_dt(&s)?),
    None => None,
  };

  Ok(RepeatHistory {
    applied_for_reference: count > 0,
    last_applied_at,
    count_today: count_today.max(0) as u32,
  })
}

const ACHIEVEMENT_COLS: &str = "achievement_id, code, version, \
                                condition_type, condition_params, xp_reward, \
                                is_repeatable, cooldown_hours, \
                                effective_from, effective_to, is_active, \
                                created_at";

fn achievement_from_row(
  row: &rusqlite::Row,
) -> rusqlite::Result<RawAchievement> {
  Ok(RawAchievement {
    achievement_id:   row.get(0)?,
    code:             row.get(1)?,
    version:          row.get(2)?,
    condition_type:   row.get(3)?,
    condition_params: row.get(4)?,
    xp_reward:        row.get(5)?,
    is_repeatable:    row.get(6)?,
    cooldown_hours:   row.get(7)?,
    effective_from:   row.get(8)?,
    effective_to:     row.get(9)?,
    is_active:        row.get(10)?,
    created_at:       row.get(11)?,
  })
}

fn insert_achievement(
  conn: &rusqlite::Connection,
  definition: &AchievementDefinition,
) -> Result<()> {
  let exists: bool = conn
    .query_row(
      "SELECT 1 FROM achievement_definitions
       WHERE code = ?1 AND version = ?2",
      rusqlite::params![definition.code, definition.version],
      |_| Ok(true),
    )
    .optional()?
    .unwrap_or(false);
  if exists {
    return Err(
      laurel_core::Error::AlreadyDefined(format!(
        "achievement {} v{}",
        definition.code, definition.version
      ))
      .into(),
    );
  }

  conn.execute(
    "INSERT INTO achievement_definitions (
       achievement_id, code, version, condition_type, condition_params,
       xp_reward, is_repeatable, cooldown_hours,
       effective_from, effective_to, is_active, created_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    rusqlite::params![
      encode_uuid(definition.achievement_id),
      definition.code,
      definition.version,
      definition.condition.discriminant(),
      definition.condition.to_params().map_err(Error::Core)?.to_string(),
      definition.xp_reward,
      definition.is_repeatable,
      definition.cooldown_hours,
      definition.effective_from.map(encode_dt),
      definition.effective_to.map(encode_dt),
      definition.is_active,
      encode_dt(definition.created_at),
    ],
  )?;
  Ok(())
}

fn find_achievement(
  conn: &rusqlite::Connection,
  code: &str,
  version: u32,
) -> Result<Option<AchievementDefinition>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {ACHIEVEMENT_COLS} FROM achievement_definitions
         WHERE code = ?1 AND version = ?2"
      ),
      rusqlite::params![code, version],
      achievement_from_row,
    )
    .optional()?;
  raw.map(RawAchievement::into_definition).transpose()
}

/// The highest-version definition row for a code.
fn latest_achievement(
  conn: &rusqlite::Connection,
  code: &str,
) -> Result<Option<AchievementDefinition>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {ACHIEVEMENT_COLS} FROM achievement_definitions
         WHERE code = ?1 ORDER BY version DESC LIMIT 1"
      ),
      rusqlite::params![code],
      achievement_from_row,
    )
    .optional()?;
  raw.map(RawAchievement::into_definition).transpose()
}

fn latest_achievement_version(
  conn: &rusqlite::Connection,
  code: &str,
) -> Result<Option<u32>> {
  let version: Option<i64> = conn
    .query_row(
      "SELECT MAX(version) FROM achievement_definitions WHERE code = ?1",
      rusqlite::params![code],
      |row| row.get(0),
    )
    .optional()?
    .flatten();
  Ok(version.and_then(|v| u32::try_from(v).ok()))
}

const GRANT_COLS: &str = "ua_id, user_id, achievement_id, code, \
                          achievement_version, event_id, xp_reward, scope, \
                          unlocked_at, details";

fn grant_from_row(row: &rusqlite::Row) -> rusqlite::Result<RawUserAchievement> {
  Ok(RawUserAchievement {
    ua_id:               row.get(0)?,
    user_id:             row.get(1)?,
    achievement_id:      row.get(2)?,
    code:                row.get(3)?,
    achievement_version: row.get(4)?,
    event_id:            row.get(5)?,
    xp_reward:           row.get(6)?,
    scope:               row.get(7)?,
    unlocked_at:         row.get(8)?,
    details:             row.get(9)?,
  })
}

fn insert_grant(
  conn: &rusqlite::Connection,
  grant: &UserAchievement,
) -> Result<()> {
  conn.execute(
    "INSERT INTO user_achievements (
       ua_id, user_id, achievement_id, code, achievement_version,
       event_id, xp_reward, scope, unlocked_at, details
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    rusqlite::params![
      encode_uuid(grant.ua_id),
      encode_uuid(grant.user_id),
      encode_uuid(grant.achievement_id),
      grant.code,
      grant.achievement_version,
      grant.event_id.map(encode_uuid),
      grant.xp_reward,
      grant.scope,
      encode_dt(grant.unlocked_at),
      grant.details.to_string(),
    ],
  )?;
  Ok(())
}

/// Most recent grant for (user, achievement definition, scope).
fn latest_grant(
  conn: &rusqlite::Connection,
  user_id: Uuid,
  achievement_id: Uuid,
  scope: Option<&str>,
) -> Result<Option<UserAchievement>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {GRANT_COLS} FROM user_achievements
         WHERE user_id = ?1 AND achievement_id = ?2 AND scope IS ?3
         ORDER BY unlocked_at DESC LIMIT 1"
      ),
      rusqlite::params![
        encode_uuid(user_id),
        encode_uuid(achievement_id),
        scope
      ],
      grant_from_row,
    )
    .optional()?;
  raw.map(RawUserAchievement::into_grant).transpose()
}

fn find_grant_by_event(
  conn: &rusqlite::Connection,
  event_id: Uuid,
) -> Result<Option<UserAchievement>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {GRANT_COLS} FROM user_achievements WHERE event_id = ?1"
      ),
      rusqlite::params![encode_uuid(event_id)],
      grant_from_row,
    )
    .optional()?;
  raw.map(RawUserAchievement::into_grant).transpose()
}

fn list_grants(
  conn: &rusqlite::Connection,
  user_id: Uuid,
) -> Result<Vec<UserAchievement>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {GRANT_COLS} FROM user_achievements
     WHERE user_id = ?1 ORDER BY unlocked_at DESC"
  ))?;
  let raws = stmt
    .query_map(rusqlite::params![encode_uuid(user_id)], grant_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawUserAchievement::into_grant).collect()
}

/// Grants with no backing ledger event (pre-ledger history).
fn unsynced_grants(
  conn: &rusqlite::Connection,
  user_id: Uuid,
) -> Result<Vec<UserAchievement>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {GRANT_COLS} FROM user_achievements
     WHERE user_id = ?1 AND event_id IS NULL
     ORDER BY unlocked_at"
  ))?;
  let raws = stmt
    .query_map(rusqlite::params![encode_uuid(user_id)], grant_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawUserAchievement::into_grant).collect()
}

fn link_grant_event(
  conn: &rusqlite::Connection,
  ua_id: Uuid,
  event_id: Uuid,
) -> Result<()> {
  conn.execute(
    "UPDATE user_achievements SET event_id = ?2 WHERE ua_id = ?1",
    rusqlite::params![encode_uuid(ua_id), encode_uuid(event_id)],
  )?;
  Ok(())
}

/// Per-user sums of attributable grant events for a source, across all
/// users. Compensating events carry their own `source_type` and are never
/// included.
struct AttributableTotal {
  user_id:    Uuid,
  xp_granted: i64,
  events:     u64,
}

fn attributable_totals(
  conn: &rusqlite::Connection,
  source_type: &str,
  action_type: &str,
  version: Option<u32>,
) -> Result<Vec<AttributableTotal>> {
  let mut stmt = conn.prepare(
    "SELECT user_id, SUM(xp_delta), COUNT(*) FROM xp_events
     WHERE source_type = ?1 AND action_type = ?2
       AND (?3 IS NULL OR source_version = ?3)
     GROUP BY user_id
     ORDER BY user_id",
  )?;
  let rows = stmt
    .query_map(
      rusqlite::params![source_type, action_type, version],
      |row| {
        let user: String = row.get(0)?;
        let sum: i64 = row.get(1)?;
        let count: i64 = row.get(2)?;
        Ok((user, sum, count))
      },
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  rows
    .into_iter()
    .map(|(user, sum, count)| {
      Ok(AttributableTotal {
        user_id:    crate::encode::decode_uuid(&user)?,
        xp_granted: sum,
        events:     count.max(0) as u64,
      })
    })
    .collect()
}

fn user_attributable_sum(
  conn: &rusqlite::Connection,
  user_id: Uuid,
  source_type: &str,
  action_type: &str,
  version: Option<u32>,
) -> Result<i64> {
  let sum: i64 = conn.query_row(
    "SELECT COALESCE(SUM(xp_delta), 0) FROM xp_events
     WHERE user_id = ?1 AND source_type = ?2 AND action_type = ?3
       AND (?4 IS NULL OR source_version = ?4)",
    rusqlite::params![
      encode_uuid(user_id),
      source_type,
      action_type,
      version
    ],
    |row| row.get(0),
  )?;
  Ok(sum)
}

fn load_levels(conn: &rusqlite::Connection) -> Result<Vec<LevelDefinition>> {
  let mut stmt = conn.prepare(
    "SELECT level, xp_required, xp_for_next
     FROM level_definitions ORDER BY xp_required",
  )?;
  let rows = stmt
    .query_map([], |row| {
      let level: i64 = row.get(0)?;
      let xp_required: i64 = row.get(1)?;
      let xp_for_next: Option<i64> = row.get(2)?;
      Ok((level, xp_required, xp_for_next))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  rows
    .into_iter()
    .map(|(level, xp_required, xp_for_next)| {
      Ok(LevelDefinition {
        level: crate::encode::decode_version(level)?,
        xp_required,
        xp_for_next,
      })
    })
    .collect()
}

fn seed_levels(
  conn: &mut rusqlite::Connection,
  defs: &[LevelDefinition],
) -> Result<()> {
  let tx = conn.transaction()?;
  for def in defs {
    tx.execute(
      "INSERT INTO level_definitions (level, xp_required, xp_for_next)
       VALUES (?1, ?2, ?3)",
      rusqlite::params![def.level, def.xp_required, def.xp_for_next],
    )?;
  }
  tx.commit()?;
  Ok(())
}
