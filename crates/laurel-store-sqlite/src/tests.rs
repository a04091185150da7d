use chrono::{Duration, Utc};
use laurel_core::{
  Error,
  achievement::UnlockRequest,
  compensation::CompensationRequest,
  event::{CreditRequest, SourceRef},
  registry::{
    AchievementCondition, CompletionUnit, NewAchievement, NewXpSource,
    ProgressSnapshot,
  },
  store::XpStore,
};
use uuid::Uuid;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory().await.unwrap()
}

fn lesson_source(xp: i64) -> NewXpSource {
  let mut source = NewXpSource::new("lesson", "completed", 1, xp);
  source.is_repeatable = true;
  source
}

fn credit(user: Uuid, delta: i64, key: &str) -> CreditRequest {
  CreditRequest::new(user, SourceRef::new("lesson", "completed"), delta, key)
}

fn achievement(code: &str, version: u32, reward: i64) -> NewAchievement {
  NewAchievement::new(
    code,
    version,
    AchievementCondition::XpThreshold { amount: 0 },
    reward,
  )
}

// ─── Crediting ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn credits_accumulate_and_replay_idempotently() {
  let store = store().await;
  store.define_xp_source(lesson_source(30)).await.unwrap();
  let user = Uuid::new_v4();

  store.credit_xp(credit(user, 80, "seed")).await.unwrap();

  let first = store.credit_xp(credit(user, 30, "k1")).await.unwrap();
  assert_eq!(first.xp_before, 80);
  assert_eq!(first.xp_after, 110);
  assert_eq!(first.level_before, 1);
  assert_eq!(first.level_after, 2);
  assert!(!first.idempotent);

  // Same key: same outcome, no second event.
  let replay = store.credit_xp(credit(user, 30, "k1")).await.unwrap();
  assert!(replay.idempotent);
  assert_eq!(replay.event_id, first.event_id);
  assert_eq!(replay.xp_after, 110);

  let events = store.get_events(user, None, None).await.unwrap();
  assert_eq!(events.len(), 2);

  let profile = store.get_profile(user).await.unwrap().unwrap();
  assert_eq!(profile.xp, 110);
  assert_eq!(profile.level, 2);
}

#[tokio::test]
async fn profile_equals_sum_of_event_deltas() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  let user = Uuid::new_v4();

  for i in 0..5 {
    store
      .credit_xp(credit(user, 10 + i, &format!("k{i}")))
      .await
      .unwrap();
  }

  let events = store.get_events(user, None, None).await.unwrap();
  let sum: i64 = events.iter().map(|e| e.xp_delta).sum();
  let profile = store.get_profile(user).await.unwrap().unwrap();
  assert_eq!(profile.xp, sum);
}

#[tokio::test]
async fn empty_idempotency_key_is_rejected() {
  let store = store().await;
  let user = Uuid::new_v4();
  let result = store.credit_xp(credit(user, 10, "  ")).await;
  assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn unknown_source_is_not_found() {
  let store = store().await;
  let user = Uuid::new_v4();
  let result = store.credit_xp(credit(user, 10, "k1")).await;
  assert!(matches!(result, Err(Error::SourceNotFound { .. })));
}

#[tokio::test]
async fn stale_source_version_is_a_conflict() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  let mut v2 = lesson_source(15);
  v2.version = 2;
  store.define_xp_source(v2).await.unwrap();

  let user = Uuid::new_v4();
  let mut request = credit(user, 10, "k1");
  request.source_version = Some(1);
  let result = store.credit_xp(request).await;
  assert!(matches!(
    result,
    Err(Error::ConflictMismatch { expected: 1, actual: 2 })
  ));

  let mut current = credit(user, 15, "k2");
  current.source_version = Some(2);
  assert!(store.credit_xp(current).await.is_ok());
}

#[tokio::test]
async fn balance_never_goes_negative() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  let user = Uuid::new_v4();

  store.credit_xp(credit(user, 30, "k1")).await.unwrap();
  let result = store.credit_xp(credit(user, -50, "k2")).await;
  assert!(matches!(
    result,
    Err(Error::InsufficientState { xp_before: 30, xp_delta: -50 })
  ));

  // The failed attempt left no trace.
  let profile = store.get_profile(user).await.unwrap().unwrap();
  assert_eq!(profile.xp, 30);
  assert_eq!(store.get_events(user, None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_source_definition_is_rejected() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  let result = store.define_xp_source(lesson_source(20)).await;
  assert!(matches!(result, Err(Error::AlreadyDefined(_))));
}

// ─── Repeatability ───────────────────────────────────────────────────────────

#[tokio::test]
async fn non_repeatable_source_applies_once() {
  let store = store().await;
  let mut source = lesson_source(10);
  source.is_repeatable = false;
  store.define_xp_source(source).await.unwrap();
  let user = Uuid::new_v4();

  store.credit_xp(credit(user, 10, "k1")).await.unwrap();
  let result = store.credit_xp(credit(user, 10, "k2")).await;
  assert!(matches!(result, Err(Error::NotRepeatable { .. })));
}

#[tokio::test]
async fn non_repeatable_source_is_scoped_by_reference() {
  let store = store().await;
  let mut source = lesson_source(10);
  source.is_repeatable = false;
  store.define_xp_source(source).await.unwrap();

  let user = Uuid::new_v4();
  let lesson_a = Uuid::new_v4();
  let lesson_b = Uuid::new_v4();

  let mut first = credit(user, 10, "k1");
  first.reference_id = Some(lesson_a);
  store.credit_xp(first).await.unwrap();

  // Different lesson: fresh eligibility.
  let mut other = credit(user, 10, "k2");
  other.reference_id = Some(lesson_b);
  store.credit_xp(other).await.unwrap();

  // Same lesson again, new key: rejected.
  let mut again = credit(user, 10, "k3");
  again.reference_id = Some(lesson_a);
  assert!(matches!(
    store.credit_xp(again).await,
    Err(Error::NotRepeatable { .. })
  ));
}

#[tokio::test]
async fn cooldown_blocks_rapid_repeats() {
  let store = store().await;
  let mut source = lesson_source(10);
  source.cooldown_minutes = Some(30);
  store.define_xp_source(source).await.unwrap();
  let user = Uuid::new_v4();

  store.credit_xp(credit(user, 10, "k1")).await.unwrap();
  let result = store.credit_xp(credit(user, 10, "k2")).await;
  assert!(matches!(result, Err(Error::CooldownActive { .. })));
}

#[tokio::test]
async fn daily_limit_caps_grants() {
  let store = store().await;
  let mut source = lesson_source(10);
  source.max_per_day = Some(2);
  store.define_xp_source(source).await.unwrap();
  let user = Uuid::new_v4();

  store.credit_xp(credit(user, 10, "k1")).await.unwrap();
  store.credit_xp(credit(user, 10, "k2")).await.unwrap();
  let result = store.credit_xp(credit(user, 10, "k3")).await;
  assert!(matches!(
    result,
    Err(Error::DailyLimitReached { max_per_day: 2, .. })
  ));
}

#[tokio::test]
async fn expired_source_is_not_found() {
  let store = store().await;
  let now = Utc::now();
  let mut source = lesson_source(10);
  source.effective_from = Some(now - Duration::days(30));
  source.effective_to = Some(now - Duration::days(1));
  store.define_xp_source(source).await.unwrap();

  let user = Uuid::new_v4();
  let result = store.credit_xp(credit(user, 10, "k1")).await;
  assert!(matches!(result, Err(Error::SourceNotFound { .. })));

  // It still shows up when asking about the past.
  let past = now - Duration::days(10);
  let then = store.get_active_xp_sources(Some(past)).await.unwrap();
  assert_eq!(then.len(), 1);
  let current = store.get_active_xp_sources(None).await.unwrap();
  assert!(current.is_empty());
}

#[tokio::test]
async fn achievement_source_credit_applies_once() {
  let store = store().await;
  store
    .define_achievement(achievement("badge", 1, 50))
    .await
    .unwrap();
  let user = Uuid::new_v4();

  let first = store
    .credit_xp(CreditRequest::new(
      user,
      SourceRef::achievement("badge"),
      50,
      "a1",
    ))
    .await
    .unwrap();
  assert_eq!(first.xp_after, 50);

  // A fresh key must not award the one-time achievement again.
  let result = store
    .credit_xp(CreditRequest::new(
      user,
      SourceRef::achievement("badge"),
      50,
      "a2",
    ))
    .await;
  assert!(matches!(result, Err(Error::NotRepeatable { .. })));
  assert_eq!(store.get_profile(user).await.unwrap().unwrap().xp, 50);
}

#[tokio::test]
async fn unlock_blocks_a_later_direct_achievement_credit() {
  let store = store().await;
  store
    .define_achievement(achievement("badge", 1, 50))
    .await
    .unwrap();
  let user = Uuid::new_v4();

  store
    .unlock_achievement(UnlockRequest::new(user, "badge", 1, "u1"))
    .await
    .unwrap();

  // The grant event already counts against the credit path.
  let result = store
    .credit_xp(CreditRequest::new(
      user,
      SourceRef::achievement("badge"),
      50,
      "a1",
    ))
    .await;
  assert!(matches!(result, Err(Error::NotRepeatable { .. })));
}

#[tokio::test]
async fn repeatable_achievement_credit_respects_cooldown() {
  let store = store().await;
  let mut definition = achievement("daily-bonus", 1, 5);
  definition.is_repeatable = true;
  definition.cooldown_hours = Some(20);
  store.define_achievement(definition).await.unwrap();
  let user = Uuid::new_v4();

  store
    .credit_xp(CreditRequest::new(
      user,
      SourceRef::achievement("daily-bonus"),
      5,
      "a1",
    ))
    .await
    .unwrap();
  let result = store
    .credit_xp(CreditRequest::new(
      user,
      SourceRef::achievement("daily-bonus"),
      5,
      "a2",
    ))
    .await;
  assert!(matches!(result, Err(Error::CooldownActive { .. })));
}

// ─── Unlocking ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn unlock_grants_and_credits_once() {
  let store = store().await;
  store
    .define_achievement(achievement("first-steps", 1, 50))
    .await
    .unwrap();
  let user = Uuid::new_v4();

  let first = store
    .unlock_achievement(UnlockRequest::new(user, "first-steps", 1, "u1"))
    .await
    .unwrap();
  assert!(!first.idempotent);
  assert_eq!(first.xp_after, 50);

  // Same key: replay.
  let replay = store
    .unlock_achievement(UnlockRequest::new(user, "first-steps", 1, "u1"))
    .await
    .unwrap();
  assert!(replay.idempotent);
  assert_eq!(replay.ua_id, first.ua_id);
  assert_eq!(replay.xp_after, 50);

  // New key, already held, non-repeatable: success, no new XP.
  let held = store
    .unlock_achievement(UnlockRequest::new(user, "first-steps", 1, "u2"))
    .await
    .unwrap();
  assert!(held.idempotent);
  assert_eq!(held.ua_id, first.ua_id);
  assert_eq!(held.xp_after, 50);

  let grants = store.get_user_achievements(user).await.unwrap();
  assert_eq!(grants.len(), 1);
  assert_eq!(grants[0].event_id, first.event_id);

  let profile = store.get_profile(user).await.unwrap().unwrap();
  assert_eq!(profile.xp, 50);
}

#[tokio::test]
async fn unlock_of_stale_version_is_a_conflict() {
  let store = store().await;
  store
    .define_achievement(achievement("streak", 1, 20))
    .await
    .unwrap();
  store
    .define_achievement(achievement("streak", 2, 25))
    .await
    .unwrap();

  let user = Uuid::new_v4();
  let result = store
    .unlock_achievement(UnlockRequest::new(user, "streak", 1, "u1"))
    .await;
  assert!(matches!(
    result,
    Err(Error::ConflictMismatch { expected: 1, actual: 2 })
  ));
}

#[tokio::test]
async fn unlock_of_unknown_achievement_is_not_found() {
  let store = store().await;
  let user = Uuid::new_v4();
  let result = store
    .unlock_achievement(UnlockRequest::new(user, "ghost", 1, "u1"))
    .await;
  assert!(matches!(result, Err(Error::AchievementNotFound { .. })));
}

#[tokio::test]
async fn unmet_condition_blocks_the_unlock() {
  let store = store().await;
  let mut definition = achievement("week-streak", 1, 40);
  definition.condition = AchievementCondition::StreakLength { days: 7 };
  store.define_achievement(definition).await.unwrap();
  let user = Uuid::new_v4();

  let mut request = UnlockRequest::new(user, "week-streak", 1, "u1");
  request.progress = Some(ProgressSnapshot {
    streak_days: 3,
    ..Default::default()
  });
  assert!(matches!(
    store.unlock_achievement(request).await,
    Err(Error::Validation(_))
  ));

  let mut met = UnlockRequest::new(user, "week-streak", 1, "u2");
  met.progress = Some(ProgressSnapshot {
    streak_days: 7,
    ..Default::default()
  });
  assert!(store.unlock_achievement(met).await.is_ok());
}

#[tokio::test]
async fn unlock_rejects_a_key_consumed_by_a_plain_credit() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  store
    .define_achievement(achievement("first-steps", 1, 50))
    .await
    .unwrap();
  let user = Uuid::new_v4();

  store.credit_xp(credit(user, 10, "shared")).await.unwrap();
  let result = store
    .unlock_achievement(UnlockRequest::new(user, "first-steps", 1, "shared"))
    .await;
  assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn repeatable_achievement_respects_cooldown() {
  let store = store().await;
  let mut definition = achievement("daily-login", 1, 5);
  definition.is_repeatable = true;
  definition.cooldown_hours = Some(20);
  store.define_achievement(definition).await.unwrap();
  let user = Uuid::new_v4();

  store
    .unlock_achievement(UnlockRequest::new(user, "daily-login", 1, "u1"))
    .await
    .unwrap();
  let result = store
    .unlock_achievement(UnlockRequest::new(user, "daily-login", 1, "u2"))
    .await;
  assert!(matches!(result, Err(Error::CooldownActive { .. })));
}

#[tokio::test]
async fn scope_partitions_eligibility() {
  let store = store().await;
  store
    .define_achievement(achievement("course-finisher", 1, 30))
    .await
    .unwrap();
  let user = Uuid::new_v4();

  let mut course_a = UnlockRequest::new(user, "course-finisher", 1, "u1");
  course_a.scope = Some("course-a".into());
  let first = store.unlock_achievement(course_a).await.unwrap();
  assert!(!first.idempotent);

  let mut course_b = UnlockRequest::new(user, "course-finisher", 1, "u2");
  course_b.scope = Some("course-b".into());
  let second = store.unlock_achievement(course_b).await.unwrap();
  assert!(!second.idempotent);
  assert_eq!(second.xp_after, 60);

  // Same scope again: already held.
  let mut repeat = UnlockRequest::new(user, "course-finisher", 1, "u3");
  repeat.scope = Some("course-a".into());
  let held = store.unlock_achievement(repeat).await.unwrap();
  assert!(held.idempotent);
  assert_eq!(held.xp_after, 60);

  assert_eq!(store.get_user_achievements(user).await.unwrap().len(), 2);
}

// ─── Concurrency ─────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_credits_converge() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  let user = Uuid::new_v4();

  let mut handles = Vec::new();
  for i in 0..8 {
    let store = store.clone();
    handles.push(tokio::spawn(async move {
      let request = credit(user, 10, &format!("k{i}"));
      loop {
        match store.credit_xp(request.clone()).await {
          Err(Error::LockNotAcquired(_)) => tokio::task::yield_now().await,
          other => break other,
        }
      }
    }));
  }
  for handle in handles {
    handle.await.unwrap().unwrap();
  }

  let profile = store.get_profile(user).await.unwrap().unwrap();
  assert_eq!(profile.xp, 80);
  assert_eq!(store.get_events(user, None, None).await.unwrap().len(), 8);
}

// ─── Compensation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn compensation_reverts_all_users_and_reruns_safely() {
  let store = store().await;
  store
    .define_achievement(achievement("buggy-badge", 1, 100))
    .await
    .unwrap();
  let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

  store
    .unlock_achievement(UnlockRequest::new(alice, "buggy-badge", 1, "u1"))
    .await
    .unwrap();
  store
    .unlock_achievement(UnlockRequest::new(bob, "buggy-badge", 1, "u2"))
    .await
    .unwrap();

  let request = CompensationRequest {
    code:            "buggy-badge".into(),
    version:         1,
    reason:          "condition bug over-granted".into(),
    idempotency_key: "comp-1".into(),
  };
  let report = store.compensate_achievement(request.clone()).await.unwrap();
  assert_eq!(report.affected_users, 2);
  assert_eq!(report.total_events, 2);
  assert_eq!(report.total_xp_reverted, 200);
  for user in &report.users {
    assert_eq!(user.xp_removed, 100);
    assert_eq!(user.new_total_xp, 0);
  }

  // Rerun replays: same report, no further XP movement.
  let rerun = store.compensate_achievement(request).await.unwrap();
  assert_eq!(rerun.total_xp_reverted, 200);
  assert_eq!(store.get_profile(alice).await.unwrap().unwrap().xp, 0);
  assert_eq!(store.get_profile(bob).await.unwrap().unwrap().xp, 0);

  // Each user gained exactly one compensating event.
  assert_eq!(store.get_events(alice, None, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn recalculation_after_achievement_removal() {
  let store = store().await;
  store
    .define_achievement(achievement("retired", 1, 75))
    .await
    .unwrap();
  let user = Uuid::new_v4();
  store
    .unlock_achievement(UnlockRequest::new(user, "retired", 1, "u1"))
    .await
    .unwrap();

  let result = store
    .recalculate_user_xp_after_achievement_removal(
      user,
      "retired",
      None,
      "definition retired",
    )
    .await
    .unwrap();
  assert_eq!(result.xp_removed, 75);
  assert_eq!(result.new_total_xp, 0);

  // Re-running with the same reason replays the same compensation.
  let rerun = store
    .recalculate_user_xp_after_achievement_removal(
      user,
      "retired",
      None,
      "definition retired",
    )
    .await
    .unwrap();
  assert_eq!(rerun.xp_removed, 75);
  assert_eq!(store.get_profile(user).await.unwrap().unwrap().xp, 0);
}

#[tokio::test]
async fn recalculation_after_source_removal() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  let user = Uuid::new_v4();
  store.credit_xp(credit(user, 10, "k1")).await.unwrap();
  store.credit_xp(credit(user, 10, "k2")).await.unwrap();

  let result = store
    .recalculate_user_xp_after_source_removal(
      user,
      "lesson",
      "completed",
      Some(1),
      "source misconfigured",
    )
    .await
    .unwrap();
  assert_eq!(result.xp_removed, 20);
  assert_eq!(result.new_total_xp, 0);
}

#[tokio::test]
async fn recalculation_with_nothing_to_revert_is_a_noop() {
  let store = store().await;
  let user = Uuid::new_v4();
  let result = store
    .recalculate_user_xp_after_achievement_removal(
      user,
      "never-granted",
      None,
      "cleanup",
    )
    .await
    .unwrap();
  assert_eq!(result.xp_removed, 0);
  assert_eq!(result.new_total_xp, 0);
  assert!(store.get_profile(user).await.unwrap().is_none());
}

// ─── Sync ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sync_backfills_pre_ledger_grants() {
  let store = store().await;
  let definition = store
    .define_achievement(achievement("legacy-badge", 1, 60))
    .await
    .unwrap();
  let user = Uuid::new_v4();

  // A grant written before the ledger existed: no backing event.
  let ua_id = Uuid::new_v4();
  let (user_s, ua_s, def_s) = (
    user.hyphenated().to_string(),
    ua_id.hyphenated().to_string(),
    definition.achievement_id.hyphenated().to_string(),
  );
  store
    .raw()
    .call(move |conn| {
      conn.execute(
        "INSERT INTO user_achievements (
           ua_id, user_id, achievement_id, code, achievement_version,
           event_id, xp_reward, scope, unlocked_at, details
         ) VALUES (?1, ?2, ?3, 'legacy-badge', 1, NULL, 60, NULL, ?4, '{}')",
        rusqlite::params![ua_s, user_s, def_s, Utc::now().to_rfc3339()],
      )?;
      Ok(())
    })
    .await
    .unwrap();

  let report = store.sync_achievement_xp(user).await.unwrap();
  assert_eq!(report.events_added, 1);
  assert_eq!(report.xp_added, 60);
  assert_eq!(report.new_total_xp, 60);

  let grants = store.get_user_achievements(user).await.unwrap();
  assert_eq!(grants.len(), 1);
  assert!(grants[0].event_id.is_some());

  // A second pass finds nothing left to repair.
  let rerun = store.sync_achievement_xp(user).await.unwrap();
  assert_eq!(rerun.events_added, 0);
  assert_eq!(rerun.new_total_xp, 60);
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn level_info_matches_the_installed_table() {
  let store = store().await;
  let info = store.level_info(110).await.unwrap();
  assert_eq!(info.level, 2);
  assert_eq!(info.xp_to_next, 140);

  let floor = store.level_info(-5).await.unwrap();
  assert_eq!(floor.level, 1);
}

#[tokio::test]
async fn unknown_user_has_no_profile() {
  let store = store().await;
  assert!(store.get_profile(Uuid::new_v4()).await.unwrap().is_none());
  assert!(
    store
      .get_events(Uuid::new_v4(), None, None)
      .await
      .unwrap()
      .is_empty()
  );
}

#[tokio::test]
async fn event_pagination() {
  let store = store().await;
  store.define_xp_source(lesson_source(10)).await.unwrap();
  let user = Uuid::new_v4();
  for i in 0..5 {
    store.credit_xp(credit(user, 10, &format!("k{i}"))).await.unwrap();
  }

  let page = store.get_events(user, Some(2), Some(1)).await.unwrap();
  assert_eq!(page.len(), 2);
  let all = store.get_events(user, None, None).await.unwrap();
  assert_eq!(all.len(), 5);
}

#[test]
fn out_of_range_version_reports_a_bad_column() {
  let err = crate::encode::decode_version(-1).unwrap_err();
  assert!(matches!(err, crate::Error::BadColumn(_)));
  assert!(err.to_string().contains("version out of range"));
}

#[tokio::test]
async fn achievement_lookup_by_exact_version() {
  let store = store().await;
  let mut definition = achievement("counter", 1, 10);
  definition.condition = AchievementCondition::CompletionCount {
    unit:  CompletionUnit::Lessons,
    count: 10,
  };
  store.define_achievement(definition).await.unwrap();

  let found = store.get_achievement("counter", 1).await.unwrap();
  assert!(found.is_some());
  assert!(store.get_achievement("counter", 2).await.unwrap().is_none());
}
