//! Handlers for registry administration, compensation, and repair.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/rpc/define_xp_source` | Body: [`laurel_core::registry::NewXpSource`] |
//! | `POST` | `/rpc/define_achievement` | Body: [`laurel_core::registry::NewAchievement`] |
//! | `POST` | `/rpc/admin_compensate_achievement` | Body: [`CompensateBody`] |
//! | `POST` | `/rpc/recalculate_user_xp_after_achievement_removal` | Body: [`AchievementRemovalBody`] |
//! | `POST` | `/rpc/recalculate_user_xp_after_source_removal` | Body: [`SourceRemovalBody`] |
//! | `POST` | `/rpc/sync_achievement_xp` | Body: `{"user_id":"..."}` |
//!
//! Authentication and authorization for these endpoints are the mounting
//! server's responsibility.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use laurel_core::{
  compensation::{
    CompensationReport, CompensationRequest, SyncReport, UserCompensation,
  },
  registry::{NewAchievement, NewXpSource},
  store::XpStore,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;

// ─── Registry ────────────────────────────────────────────────────────────────

/// `POST /rpc/define_xp_source` — returns 201 + the stored definition.
pub async fn define_source<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<NewXpSource>,
) -> Result<impl IntoResponse, ApiError> {
  let source = store.define_xp_source(body).await?;
  Ok((StatusCode::CREATED, Json(source)))
}

/// `POST /rpc/define_achievement` — returns 201 + the stored definition.
pub async fn define_achievement<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<NewAchievement>,
) -> Result<impl IntoResponse, ApiError> {
  let definition = store.define_achievement(body).await?;
  Ok((StatusCode::CREATED, Json(definition)))
}

// ─── Compensation ────────────────────────────────────────────────────────────

/// JSON body accepted by `POST /rpc/admin_compensate_achievement`.
#[derive(Debug, Deserialize)]
pub struct CompensateBody {
  pub code:            String,
  pub version:         u32,
  pub reason:          String,
  pub idempotency_key: String,
}

/// `POST /rpc/admin_compensate_achievement`
pub async fn compensate<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<CompensateBody>,
) -> Result<Json<CompensationReport>, ApiError> {
  let report = store
    .compensate_achievement(CompensationRequest {
      code:            body.code,
      version:         body.version,
      reason:          body.reason,
      idempotency_key: body.idempotency_key,
    })
    .await?;
  Ok(Json(report))
}

/// JSON body accepted by
/// `POST /rpc/recalculate_user_xp_after_achievement_removal`.
#[derive(Debug, Deserialize)]
pub struct AchievementRemovalBody {
  pub user_id: Uuid,
  pub code:    String,
  /// All versions when absent.
  pub version: Option<u32>,
  pub reason:  String,
}

/// `POST /rpc/recalculate_user_xp_after_achievement_removal`
pub async fn recalculate_after_achievement_removal<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<AchievementRemovalBody>,
) -> Result<Json<UserCompensation>, ApiError> {
  let result = store
    .recalculate_user_xp_after_achievement_removal(
      body.user_id,
      &body.code,
      body.version,
      &body.reason,
    )
    .await?;
  Ok(Json(result))
}

/// JSON body accepted by
/// `POST /rpc/recalculate_user_xp_after_source_removal`.
#[derive(Debug, Deserialize)]
pub struct SourceRemovalBody {
  pub user_id:     Uuid,
  pub source_type: String,
  pub action_type: String,
  pub version:     Option<u32>,
  pub reason:      String,
}

/// `POST /rpc/recalculate_user_xp_after_source_removal`
pub async fn recalculate_after_source_removal<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<SourceRemovalBody>,
) -> Result<Json<UserCompensation>, ApiError> {
  let result = store
    .recalculate_user_xp_after_source_removal(
      body.user_id,
      &body.source_type,
      &body.action_type,
      body.version,
      &body.reason,
    )
    .await?;
  Ok(Json(result))
}

// ─── Sync ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SyncBody {
  pub user_id: Uuid,
}

/// `POST /rpc/sync_achievement_xp`
pub async fn sync<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<SyncBody>,
) -> Result<Json<SyncReport>, ApiError> {
  Ok(Json(store.sync_achievement_xp(body.user_id).await?))
}
