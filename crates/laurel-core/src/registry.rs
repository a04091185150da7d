//! The source and achievement registry — versioned, time-bounded definitions
//! of what may award XP and under what repeatability rules.
//!
//! Definitions are never overwritten in place once referenced: a version
//! bump is a new row. Deactivation happens via `is_active` or
//! `effective_to`, keeping old versions resolvable for compensation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

// ─── XpSource ────────────────────────────────────────────────────────────────

/// A non-achievement reason XP may be credited (e.g. completing a lesson).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpSource {
  pub source_id:        Uuid,
  pub source_type:      String,
  pub action_type:      String,
  pub version:          u32,
  pub xp_value:         i64,
  pub is_repeatable:    bool,
  pub cooldown_minutes: Option<u32>,
  pub max_per_day:      Option<u32>,
  pub effective_from:   Option<DateTime<Utc>>,
  pub effective_to:     Option<DateTime<Utc>>,
  pub is_active:        bool,
  pub created_at:       DateTime<Utc>,
}

impl XpSource {
  pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
    effective_at(self.is_active, self.effective_from, self.effective_to, at)
  }
}

/// Input to [`crate::store::XpStore::define_xp_source`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewXpSource {
  pub source_type:      String,
  pub action_type:      String,
  pub version:          u32,
  pub xp_value:         i64,
  pub is_repeatable:    bool,
  pub cooldown_minutes: Option<u32>,
  pub max_per_day:      Option<u32>,
  pub effective_from:   Option<DateTime<Utc>>,
  pub effective_to:     Option<DateTime<Utc>>,
}

impl NewXpSource {
  pub fn new(
    source_type: impl Into<String>,
    action_type: impl Into<String>,
    version: u32,
    xp_value: i64,
  ) -> Self {
    Self {
      source_type: source_type.into(),
      action_type: action_type.into(),
      version,
      xp_value,
      is_repeatable: false,
      cooldown_minutes: None,
      max_per_day: None,
      effective_from: None,
      effective_to: None,
    }
  }
}

// ─── AchievementDefinition ───────────────────────────────────────────────────

/// A one-time or cooldown-limited achievement that rewards XP when unlocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AchievementDefinition {
  pub achievement_id: Uuid,
  pub code:           String,
  pub version:        u32,
  pub condition:      AchievementCondition,
  pub xp_reward:      i64,
  pub is_repeatable:  bool,
  pub cooldown_hours: Option<u32>,
  pub effective_from: Option<DateTime<Utc>>,
  pub effective_to:   Option<DateTime<Utc>>,
  pub is_active:      bool,
  pub created_at:     DateTime<Utc>,
}

impl AchievementDefinition {
  pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
    effective_at(self.is_active, self.effective_from, self.effective_to, at)
  }

  /// Minimum gap between repeated grants, if any.
  pub fn cooldown(&self) -> Option<Duration> {
    self
      .cooldown_hours
      .map(|hours| Duration::hours(i64::from(hours)))
  }
}

/// Input to [`crate::store::XpStore::define_achievement`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAchievement {
  pub code:           String,
  pub version:        u32,
  pub condition:      AchievementCondition,
  pub xp_reward:      i64,
  pub is_repeatable:  bool,
  pub cooldown_hours: Option<u32>,
  pub effective_from: Option<DateTime<Utc>>,
  pub effective_to:   Option<DateTime<Utc>>,
}

impl NewAchievement {
  pub fn new(
    code: impl Into<String>,
    version: u32,
    condition: AchievementCondition,
    xp_reward: i64,
  ) -> Self {
    Self {
      code: code.into(),
      version,
      condition,
      xp_reward,
      is_repeatable: false,
      cooldown_hours: None,
      effective_from: None,
      effective_to: None,
    }
  }
}

fn effective_at(
  is_active: bool,
  from: Option<DateTime<Utc>>,
  to: Option<DateTime<Utc>>,
  at: DateTime<Utc>,
) -> bool {
  if !is_active {
    return false;
  }
  if let Some(from) = from
    && at < from
  {
    return false;
  }
  if let Some(to) = to
    && at >= to
  {
    return false;
  }
  true
}

// ─── Conditions ──────────────────────────────────────────────────────────────

/// What a [`CompletionCount`](AchievementCondition::CompletionCount)
/// condition counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionUnit {
  Lessons,
  Modules,
  Courses,
}

/// The typed unlock condition of an achievement. The variant name serves as
/// the `condition_type` discriminant stored in the database; each variant
/// interprets its own `condition_params` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum AchievementCondition {
  /// Consecutive days of activity.
  StreakLength { days: u32 },
  /// Total completions of lessons, modules, or courses.
  CompletionCount { unit: CompletionUnit, count: u32 },
  /// A named profile field has been filled in.
  ProfileFieldSet { field: String },
  /// Cumulative XP balance.
  XpThreshold { amount: i64 },

  /// Escape hatch: satisfied when the caller reports the flag `key`.
  Custom {
    key:    String,
    params: serde_json::Value,
  },
}

impl AchievementCondition {
  /// The discriminant string stored in the `condition_type` column.
  /// Must match the `rename_all = "snake_case"` serde tags above.
  pub fn discriminant(&self) -> &'static str {
    match self {
      Self::StreakLength { .. } => "streak_length",
      Self::CompletionCount { .. } => "completion_count",
      Self::ProfileFieldSet { .. } => "profile_field_set",
      Self::XpThreshold { .. } => "xp_threshold",
      Self::Custom { .. } => "custom",
    }
  }

  /// Serialise the params (without the type tag) for the `condition_params`
  /// database column.
  pub fn to_params(&self) -> Result<serde_json::Value> {
    let full = serde_json::to_value(self)?;
    Ok(full.get("params").cloned().unwrap_or(serde_json::Value::Null))
  }

  /// Deserialise from the discriminant string and JSON params stored in the
  /// database.
  pub fn from_parts(
    discriminant: &str,
    params: serde_json::Value,
  ) -> Result<Self> {
    let wrapped = serde_json::json!({ "type": discriminant, "params": params });
    Ok(serde_json::from_value(wrapped)?)
  }

  /// Evaluate the condition against caller-reported progress.
  pub fn evaluate(&self, progress: &ProgressSnapshot) -> bool {
    match self {
      Self::StreakLength { days } => progress.streak_days >= *days,
      Self::CompletionCount { unit, count } => {
        progress.completions(*unit) >= *count
      }
      Self::ProfileFieldSet { field } => {
        progress.profile_fields.iter().any(|f| f == field)
      }
      Self::XpThreshold { amount } => progress.xp_total >= *amount,
      Self::Custom { key, .. } => {
        progress.custom_flags.iter().any(|f| f == key)
      }
    }
  }
}

/// A caller-reported snapshot of user progress, used to gate
/// condition-checked unlocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
  #[serde(default)]
  pub streak_days:       u32,
  #[serde(default)]
  pub lessons_completed: u32,
  #[serde(default)]
  pub modules_completed: u32,
  #[serde(default)]
  pub courses_completed: u32,
  #[serde(default)]
  pub xp_total:          i64,
  /// Names of profile fields the user has filled in.
  #[serde(default)]
  pub profile_fields:    Vec<String>,
  /// Free-form flags for `Custom` conditions.
  #[serde(default)]
  pub custom_flags:      Vec<String>,
}

impl ProgressSnapshot {
  fn completions(&self, unit: CompletionUnit) -> u32 {
    match unit {
      CompletionUnit::Lessons => self.lessons_completed,
      CompletionUnit::Modules => self.modules_completed,
      CompletionUnit::Courses => self.courses_completed,
    }
  }
}

// ─── Repeat rules ────────────────────────────────────────────────────────────

/// Prior-application facts the store gathers for one (user, source,
/// reference) before a credit.
#[derive(Debug, Clone, Default)]
pub struct RepeatHistory {
  /// A prior grant event exists for the same (user, source, reference).
  pub applied_for_reference: bool,
  pub last_applied_at:       Option<DateTime<Utc>>,
  /// Grant events since the start of the current UTC day.
  pub count_today:           u32,
}

/// Check the source's repeatability rules against prior history.
pub fn check_repeat(
  source: &XpSource,
  history: &RepeatHistory,
  now: DateTime<Utc>,
) -> Result<()> {
  if !source.is_repeatable {
    if history.applied_for_reference {
      return Err(Error::NotRepeatable {
        source_type: source.source_type.clone(),
        action_type: source.action_type.clone(),
      });
    }
    return Ok(());
  }

  if let (Some(cooldown), Some(last)) =
    (source.cooldown_minutes, history.last_applied_at)
  {
    let until = last + Duration::minutes(i64::from(cooldown));
    if now < until {
      return Err(Error::CooldownActive { until });
    }
  }

  if let Some(max_per_day) = source.max_per_day
    && history.count_today >= max_per_day
  {
    return Err(Error::DailyLimitReached {
      source_type: source.source_type.clone(),
      action_type: source.action_type.clone(),
      max_per_day,
    });
  }

  Ok(())
}

/// Check an achievement definition's repeatability rules against prior
/// grant history. Applies both to unlocks and to direct credits that name
/// the achievement as their source.
pub fn check_achievement_repeat(
  definition: &AchievementDefinition,
  history: &RepeatHistory,
  now: DateTime<Utc>,
) -> Result<()> {
  if !definition.is_repeatable {
    if history.applied_for_reference {
      return Err(Error::NotRepeatable {
        source_type: crate::event::SOURCE_TYPE_ACHIEVEMENT.to_owned(),
        action_type: definition.code.clone(),
      });
    }
    return Ok(());
  }

  if let (Some(cooldown), Some(last)) =
    (definition.cooldown(), history.last_applied_at)
  {
    let until = last + cooldown;
    if now < until {
      return Err(Error::CooldownActive { until });
    }
  }

  Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  fn source(repeatable: bool) -> XpSource {
    XpSource {
      source_id:        Uuid::new_v4(),
      source_type:      "lesson".into(),
      action_type:      "completed".into(),
      version:          1,
      xp_value:         10,
      is_repeatable:    repeatable,
      cooldown_minutes: None,
      max_per_day:      None,
      effective_from:   None,
      effective_to:     None,
      is_active:        true,
      created_at:       Utc::now(),
    }
  }

  #[test]
  fn non_repeatable_rejects_second_application() {
    let s = source(false);
    let fresh = RepeatHistory::default();
    assert!(check_repeat(&s, &fresh, Utc::now()).is_ok());

    let applied = RepeatHistory {
      applied_for_reference: true,
      ..Default::default()
    };
    assert!(matches!(
      check_repeat(&s, &applied, Utc::now()),
      Err(Error::NotRepeatable { .. })
    ));
  }

  #[test]
  fn cooldown_window() {
    let mut s = source(true);
    s.cooldown_minutes = Some(30);

    let now = Utc::now();
    let recent = RepeatHistory {
      last_applied_at: Some(now - Duration::minutes(10)),
      ..Default::default()
    };
    assert!(matches!(
      check_repeat(&s, &recent, now),
      Err(Error::CooldownActive { .. })
    ));

    let stale = RepeatHistory {
      last_applied_at: Some(now - Duration::minutes(31)),
      ..Default::default()
    };
    assert!(check_repeat(&s, &stale, now).is_ok());
  }

  #[test]
  fn daily_limit() {
    let mut s = source(true);
    s.max_per_day = Some(3);

    let under = RepeatHistory { count_today: 2, ..Default::default() };
    assert!(check_repeat(&s, &under, Utc::now()).is_ok());

    let at_limit = RepeatHistory { count_today: 3, ..Default::default() };
    assert!(matches!(
      check_repeat(&s, &at_limit, Utc::now()),
      Err(Error::DailyLimitReached { max_per_day: 3, .. })
    ));
  }

  fn definition(repeatable: bool) -> AchievementDefinition {
    AchievementDefinition {
      achievement_id: Uuid::new_v4(),
      code:           "first-steps".into(),
      version:        1,
      condition:      AchievementCondition::XpThreshold { amount: 0 },
      xp_reward:      50,
      is_repeatable:  repeatable,
      cooldown_hours: None,
      effective_from: None,
      effective_to:   None,
      is_active:      true,
      created_at:     Utc::now(),
    }
  }

  #[test]
  fn non_repeatable_achievement_rejects_second_grant() {
    let d = definition(false);
    let fresh = RepeatHistory::default();
    assert!(check_achievement_repeat(&d, &fresh, Utc::now()).is_ok());

    let applied = RepeatHistory {
      applied_for_reference: true,
      ..Default::default()
    };
    assert!(matches!(
      check_achievement_repeat(&d, &applied, Utc::now()),
      Err(Error::NotRepeatable { .. })
    ));
  }

  #[test]
  fn achievement_cooldown_window() {
    let mut d = definition(true);
    d.cooldown_hours = Some(2);

    let now = Utc::now();
    let recent = RepeatHistory {
      applied_for_reference: true,
      last_applied_at: Some(now - Duration::hours(1)),
      ..Default::default()
    };
    assert!(matches!(
      check_achievement_repeat(&d, &recent, now),
      Err(Error::CooldownActive { .. })
    ));

    let stale = RepeatHistory {
      applied_for_reference: true,
      last_applied_at: Some(now - Duration::hours(3)),
      ..Default::default()
    };
    assert!(check_achievement_repeat(&d, &stale, now).is_ok());
  }

  #[test]
  fn effective_window() {
    let now = Utc::now();
    let mut s = source(true);
    assert!(s.is_effective_at(now));

    s.effective_from = Some(now + Duration::hours(1));
    assert!(!s.is_effective_at(now));

    s.effective_from = Some(now - Duration::hours(2));
    s.effective_to = Some(now - Duration::hours(1));
    assert!(!s.is_effective_at(now));

    s.effective_to = None;
    s.is_active = false;
    assert!(!s.is_effective_at(now));
  }

  #[test]
  fn condition_evaluators() {
    let progress = ProgressSnapshot {
      streak_days: 7,
      lessons_completed: 12,
      courses_completed: 1,
      xp_total: 300,
      profile_fields: vec!["avatar".into()],
      custom_flags: vec!["beta_tester".into()],
      ..Default::default()
    };

    assert!(AchievementCondition::StreakLength { days: 7 }.evaluate(&progress));
    assert!(!AchievementCondition::StreakLength { days: 8 }.evaluate(&progress));

    let lessons = AchievementCondition::CompletionCount {
      unit:  CompletionUnit::Lessons,
      count: 10,
    };
    assert!(lessons.evaluate(&progress));
    let modules = AchievementCondition::CompletionCount {
      unit:  CompletionUnit::Modules,
      count: 1,
    };
    assert!(!modules.evaluate(&progress));

    let field = AchievementCondition::ProfileFieldSet { field: "avatar".into() };
    assert!(field.evaluate(&progress));

    assert!(AchievementCondition::XpThreshold { amount: 250 }.evaluate(&progress));

    let custom = AchievementCondition::Custom {
      key:    "beta_tester".into(),
      params: serde_json::Value::Null,
    };
    assert!(custom.evaluate(&progress));
  }

  #[test]
  fn condition_storage_roundtrip() {
    let original = AchievementCondition::CompletionCount {
      unit:  CompletionUnit::Courses,
      count: 3,
    };
    let discriminant = original.discriminant();
    let params = original.to_params().unwrap();
    let decoded =
      AchievementCondition::from_parts(discriminant, params).unwrap();
    assert_eq!(decoded, original);
  }

  #[test]
  fn unknown_condition_type_is_an_error() {
    let result = AchievementCondition::from_parts(
      "does_not_exist",
      serde_json::Value::Null,
    );
    assert!(result.is_err());
  }
}
