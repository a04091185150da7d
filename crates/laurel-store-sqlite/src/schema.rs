//! SQL schema for the Laurel SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS level_definitions (
    level       INTEGER PRIMARY KEY,
    xp_required INTEGER NOT NULL UNIQUE,  -- cumulative XP to reach this level
    xp_for_next INTEGER                   -- NULL for the final level
);

CREATE TABLE IF NOT EXISTS xp_sources (
    source_id        TEXT PRIMARY KEY,
    source_type      TEXT NOT NULL,
    action_type      TEXT NOT NULL,
    version          INTEGER NOT NULL,
    xp_value         INTEGER NOT NULL,
    is_repeatable    INTEGER NOT NULL DEFAULT 0,
    cooldown_minutes INTEGER,
    max_per_day      INTEGER,
    effective_from   TEXT,
    effective_to     TEXT,
    is_active        INTEGER NOT NULL DEFAULT 1,
    created_at       TEXT NOT NULL,
    UNIQUE (source_type, action_type, version)
);

CREATE TABLE IF NOT EXISTS achievement_definitions (
    achievement_id   TEXT PRIMARY KEY,
    code             TEXT NOT NULL,
    version          INTEGER NOT NULL,
    condition_type   TEXT NOT NULL,   -- discriminant of AchievementCondition
    condition_params TEXT NOT NULL,   -- JSON params (inner data only)
    xp_reward        INTEGER NOT NULL,
    is_repeatable    INTEGER NOT NULL DEFAULT 0,
    cooldown_hours   INTEGER,
    effective_from   TEXT,
    effective_to     TEXT,
    is_active        INTEGER NOT NULL DEFAULT 1,
    created_at       TEXT NOT NULL,
    UNIQUE (code, version)
);

-- The ledger is strictly append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS xp_events (
    event_id        TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    source_type     TEXT NOT NULL,
    source_id       TEXT,
    action_type     TEXT NOT NULL,
    source_version  INTEGER,
    idempotency_key TEXT NOT NULL,
    reference_id    TEXT,
    xp_delta        INTEGER NOT NULL,
    xp_before       INTEGER NOT NULL,
    xp_after        INTEGER NOT NULL,
    level_before    INTEGER NOT NULL,
    level_after     INTEGER NOT NULL,
    metadata        TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,   -- RFC 3339 UTC; server-assigned
    UNIQUE (user_id, idempotency_key),
    CHECK  (xp_after = xp_before + xp_delta AND xp_after >= 0)
);

CREATE TABLE IF NOT EXISTS user_achievements (
    ua_id               TEXT PRIMARY KEY,
    user_id             TEXT NOT NULL,
    achievement_id      TEXT NOT NULL REFERENCES achievement_definitions(achievement_id),
    code                TEXT NOT NULL,
    achievement_version INTEGER NOT NULL,
    event_id            TEXT REFERENCES xp_events(event_id),
    xp_reward           INTEGER NOT NULL,
    scope               TEXT,
    unlocked_at         TEXT NOT NULL,
    details             TEXT NOT NULL DEFAULT '{}'
);

-- Materialized projection of each user's event stream. Written only in the
-- same transaction as the event that justifies the new value.
CREATE TABLE IF NOT EXISTS user_profiles (
    user_id    TEXT PRIMARY KEY,
    xp         INTEGER NOT NULL,
    level      INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS xp_events_user_idx
  ON xp_events(user_id);
CREATE INDEX IF NOT EXISTS xp_events_source_idx
  ON xp_events(source_type, action_type);
CREATE INDEX IF NOT EXISTS user_achievements_user_idx
  ON user_achievements(user_id);

PRAGMA user_version = 1;
";
