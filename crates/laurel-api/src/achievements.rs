//! Handlers for achievement unlocking and lookup.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/rpc/unlock_achievement` | Body: [`UnlockBody`] |
//! | `POST` | `/rpc/unlock_achievement_safe` | Same body; `progress` required |
//! | `GET`  | `/rpc/get_achievement` | `?code=&version=` |
//! | `GET`  | `/rpc/get_user_achievements` | `?user_id=` |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Query, State},
};
use laurel_core::{
  achievement::{UnlockOutcome, UnlockRequest, UserAchievement},
  registry::{AchievementDefinition, ProgressSnapshot},
  store::XpStore,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;

// ─── Unlock ──────────────────────────────────────────────────────────────────

/// JSON body accepted by `POST /rpc/unlock_achievement` and
/// `/rpc/unlock_achievement_safe`.
#[derive(Debug, Deserialize)]
pub struct UnlockBody {
  pub user_id:         Uuid,
  pub code:            String,
  pub version:         u32,
  pub idempotency_key: String,
  pub scope:           Option<String>,
  pub reference_id:    Option<Uuid>,
  pub progress:        Option<ProgressSnapshot>,
}

impl From<UnlockBody> for UnlockRequest {
  fn from(b: UnlockBody) -> Self {
    UnlockRequest {
      user_id:         b.user_id,
      code:            b.code,
      version:         b.version,
      idempotency_key: b.idempotency_key,
      scope:           b.scope,
      reference_id:    b.reference_id,
      progress:        b.progress,
    }
  }
}

/// `POST /rpc/unlock_achievement`
pub async fn unlock<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<UnlockBody>,
) -> Result<Json<UnlockOutcome>, ApiError> {
  let outcome = store.unlock_achievement(UnlockRequest::from(body)).await?;
  Ok(Json(outcome))
}

/// `POST /rpc/unlock_achievement_safe` — requires a progress snapshot so the
/// condition is always evaluated server-side.
pub async fn unlock_safe<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<UnlockBody>,
) -> Result<Json<UnlockOutcome>, ApiError> {
  if body.progress.is_none() {
    return Err(ApiError::BadRequest("progress is required".into()));
  }
  let outcome = store.unlock_achievement(UnlockRequest::from(body)).await?;
  Ok(Json(outcome))
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AchievementParams {
  pub code:    String,
  pub version: u32,
}

/// `GET /rpc/get_achievement?code=<code>&version=<v>`
pub async fn get_one<S: XpStore>(
  State(store): State<Arc<S>>,
  Query(params): Query<AchievementParams>,
) -> Result<Json<AchievementDefinition>, ApiError> {
  let definition = store
    .get_achievement(&params.code, params.version)
    .await?
    .ok_or_else(|| {
      ApiError::NotFound(format!(
        "achievement {} v{} not found",
        params.code, params.version
      ))
    })?;
  Ok(Json(definition))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub user_id: Uuid,
}

/// `GET /rpc/get_user_achievements?user_id=<id>`
pub async fn list<S: XpStore>(
  State(store): State<Arc<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<UserAchievement>>, ApiError> {
  Ok(Json(store.get_user_achievements(params.user_id).await?))
}
