//! Encoding and decoding helpers between Rust domain types and the
//! plain-text representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings. Structured fields
//! (condition params, metadata, details) are stored as compact JSON. UUIDs
//! are stored as hyphenated lowercase strings.

use chrono::{DateTime, Utc};
use laurel_core::{
  achievement::UserAchievement,
  event::{UserProfile, XpEvent},
  registry::{AchievementCondition, AchievementDefinition, XpSource},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn decode_uuid_opt(s: Option<&str>) -> Result<Option<Uuid>> {
  s.map(decode_uuid).transpose()
}

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn decode_dt_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

// ─── Versions ────────────────────────────────────────────────────────────────

pub fn decode_version(v: i64) -> Result<u32> {
  u32::try_from(v)
    .map_err(|_| Error::BadColumn(format!("version out of range: {v}")))
}

pub fn decode_version_opt(v: Option<i64>) -> Result<Option<u32>> {
  v.map(decode_version).transpose()
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from an `xp_events` row.
pub struct RawXpEvent {
  pub event_id:        String,
  pub user_id:         String,
  pub source_type:     String,
  pub source_id:       Option<String>,
  pub action_type:     String,
  pub source_version:  Option<i64>,
  pub idempotency_key: String,
  pub reference_id:    Option<String>,
  pub xp_delta:        i64,
  pub xp_before:       i64,
  pub xp_after:        i64,
  pub level_before:    i64,
  pub level_after:     i64,
  pub metadata:        String,
  pub created_at:      String,
}

impl RawXpEvent {
  pub fn into_event(self) -> Result<XpEvent> {
    Ok(XpEvent {
      event_id:        decode_uuid(&self.event_id)?,
      user_id:         decode_uuid(&self.user_id)?,
      source_type:     self.source_type,
      source_id:       decode_uuid_opt(self.source_id.as_deref())?,
      action_type:     self.action_type,
      source_version:  decode_version_opt(self.source_version)?,
      idempotency_key: self.idempotency_key,
      reference_id:    decode_uuid_opt(self.reference_id.as_deref())?,
      xp_delta:        self.xp_delta,
      xp_before:       self.xp_before,
      xp_after:        self.xp_after,
      level_before:    decode_version(self.level_before)?,
      level_after:     decode_version(self.level_after)?,
      metadata:        serde_json::from_str(&self.metadata)?,
      created_at:      decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values read directly from an `xp_sources` row.
pub struct RawXpSource {
  pub source_id:        String,
  pub source_type:      String,
  pub action_type:      String,
  pub version:          i64,
  pub xp_value:         i64,
  pub is_repeatable:    bool,
  pub cooldown_minutes: Option<i64>,
  pub max_per_day:      Option<i64>,
  pub effective_from:   Option<String>,
  pub effective_to:     Option<String>,
  pub is_active:        bool,
  pub created_at:       String,
}

impl RawXpSource {
  pub fn into_source(self) -> Result<XpSource> {
    Ok(XpSource {
      source_id:        decode_uuid(&self.source_id)?,
      source_type:      self.source_type,
      action_type:      self.action_type,
      version:          decode_version(self.version)?,
      xp_value:         self.xp_value,
      is_repeatable:    self.is_repeatable,
      cooldown_minutes: decode_version_opt(self.cooldown_minutes)?,
      max_per_day:      decode_version_opt(self.max_per_day)?,
      effective_from:   decode_dt_opt(self.effective_from.as_deref())?,
      effective_to:     decode_dt_opt(self.effective_to.as_deref())?,
      is_active:        self.is_active,
      created_at:       decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values read directly from an `achievement_definitions` row.
pub struct RawAchievement {
  pub achievement_id:   String,
  pub code:             String,
  pub version:          i64,
  pub condition_type:   String,
  pub condition_params: String,
  pub xp_reward:        i64,
  pub is_repeatable:    bool,
  pub cooldown_hours:   Option<i64>,
  pub effective_from:   Option<String>,
  pub effective_to:     Option<String>,
  pub is_active:        bool,
  pub created_at:       String,
}

impl RawAchievement {
  pub fn into_definition(self) -> Result<AchievementDefinition> {
    let params: serde_json::Value =
      serde_json::from_str(&self.condition_params)?;
    let condition =
      AchievementCondition::from_parts(&self.condition_type, params)
        .map_err(Error::Core)?;

    Ok(AchievementDefinition {
      achievement_id: decode_uuid(&self.achievement_id)?,
      code:           self.code,
      version:        decode_version(self.version)?,
      condition,
      xp_reward:      self.xp_reward,
      is_repeatable:  self.is_repeatable,
      cooldown_hours: decode_version_opt(self.cooldown_hours)?,
      effective_from: decode_dt_opt(self.effective_from.as_deref())?,
      effective_to:   decode_dt_opt(self.effective_to.as_deref())?,
      is_active:      self.is_active,
      created_at:     decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values read directly from a `user_achievements` row.
pub struct RawUserAchievement {
  pub ua_id:               String,
  pub user_id:             String,
  pub achievement_id:      String,
  pub code:                String,
  pub achievement_version: i64,
  pub event_id:            Option<String>,
  pub xp_reward:           i64,
  pub scope:               Option<String>,
  pub unlocked_at:         String,
  pub details:             String,
}

impl RawUserAchievement {
  pub fn into_grant(self) -> Result<UserAchievement> {
    Ok(UserAchievement {
      ua_id:               decode_uuid(&self.ua_id)?,
      user_id:             decode_uuid(&self.user_id)?,
      achievement_id:      decode_uuid(&self.achievement_id)?,
      code:                self.code,
      achievement_version: decode_version(self.achievement_version)?,
      event_id:            decode_uuid_opt(self.event_id.as_deref())?,
      xp_reward:           self.xp_reward,
      scope:               self.scope,
      unlocked_at:         decode_dt(&self.unlocked_at)?,
      details:             serde_json::from_str(&self.details)?,
    })
  }
}

/// Raw values read directly from a `user_profiles` row.
pub struct RawProfile {
  pub user_id:    String,
  pub xp:         i64,
  pub level:      i64,
  pub updated_at: String,
}

impl RawProfile {
  pub fn into_profile(self) -> Result<UserProfile> {
    Ok(UserProfile {
      user_id:    decode_uuid(&self.user_id)?,
      xp:         self.xp,
      level:      decode_version(self.level)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}
