//! Handlers for XP crediting and read endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/rpc/credit_xp` | Body: [`CreditBody`]; any `source_version` is ignored |
//! | `POST` | `/rpc/credit_xp_safe` | Same body; `source_version` required |
//! | `GET`  | `/rpc/compute_level_info` | `?xp_total=` |
//! | `GET`  | `/rpc/get_active_xp_sources` | Optional `?at=` (RFC 3339) |
//! | `GET`  | `/rpc/get_xp_events` | `?user_id=`; optional `limit`, `offset` |
//! | `GET`  | `/rpc/get_user_profile` | `?user_id=`; 404 if no ledger history |

use std::sync::Arc;

use axum::{
  Json,
  extract::{Query, State},
};
use chrono::{DateTime, Utc};
use laurel_core::{
  event::{CreditOutcome, CreditRequest, SourceRef, UserProfile, XpEvent},
  level::LevelInfo,
  registry::XpSource,
  store::XpStore,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;

// ─── Credit ──────────────────────────────────────────────────────────────────

/// JSON body accepted by `POST /rpc/credit_xp` and `/rpc/credit_xp_safe`.
#[derive(Debug, Deserialize)]
pub struct CreditBody {
  pub user_id:         Uuid,
  pub source_type:     String,
  pub action_type:     String,
  pub xp_amount:       i64,
  pub idempotency_key: String,
  pub reference_id:    Option<Uuid>,
  /// Only honoured by the `_safe` variant.
  pub source_version:  Option<u32>,
  pub metadata:        Option<serde_json::Value>,
}

impl CreditBody {
  fn into_request(self, source_version: Option<u32>) -> CreditRequest {
    CreditRequest {
      user_id: self.user_id,
      source: SourceRef::new(self.source_type, self.action_type),
      xp_delta: self.xp_amount,
      idempotency_key: self.idempotency_key,
      reference_id: self.reference_id,
      source_version,
      metadata: self
        .metadata
        .unwrap_or(serde_json::Value::Object(Default::default())),
    }
  }
}

/// `POST /rpc/credit_xp`
pub async fn credit<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<CreditBody>,
) -> Result<Json<CreditOutcome>, ApiError> {
  let outcome = store.credit_xp(body.into_request(None)).await?;
  Ok(Json(outcome))
}

/// `POST /rpc/credit_xp_safe` — rejects requests without a version token.
pub async fn credit_safe<S: XpStore>(
  State(store): State<Arc<S>>,
  Json(body): Json<CreditBody>,
) -> Result<Json<CreditOutcome>, ApiError> {
  let version = body.source_version.ok_or_else(|| {
    ApiError::BadRequest("source_version is required".into())
  })?;
  let outcome = store.credit_xp(body.into_request(Some(version))).await?;
  Ok(Json(outcome))
}

// ─── Reads ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LevelParams {
  pub xp_total: i64,
}

/// `GET /rpc/compute_level_info?xp_total=<n>`
pub async fn level_info<S: XpStore>(
  State(store): State<Arc<S>>,
  Query(params): Query<LevelParams>,
) -> Result<Json<LevelInfo>, ApiError> {
  Ok(Json(store.level_info(params.xp_total).await?))
}

#[derive(Debug, Deserialize)]
pub struct ActiveSourcesParams {
  /// Point-in-time filter on the effective window. Defaults to now.
  pub at: Option<DateTime<Utc>>,
}

/// `GET /rpc/get_active_xp_sources[?at=...]`
pub async fn active_sources<S: XpStore>(
  State(store): State<Arc<S>>,
  Query(params): Query<ActiveSourcesParams>,
) -> Result<Json<Vec<XpSource>>, ApiError> {
  Ok(Json(store.get_active_xp_sources(params.at).await?))
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
  pub user_id: Uuid,
  pub limit:   Option<usize>,
  pub offset:  Option<usize>,
}

/// `GET /rpc/get_xp_events?user_id=<id>[&limit=...][&offset=...]`
pub async fn events<S: XpStore>(
  State(store): State<Arc<S>>,
  Query(params): Query<EventsParams>,
) -> Result<Json<Vec<XpEvent>>, ApiError> {
  let events = store
    .get_events(params.user_id, params.limit, params.offset)
    .await?;
  Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct ProfileParams {
  pub user_id: Uuid,
}

/// `GET /rpc/get_user_profile?user_id=<id>`
pub async fn profile<S: XpStore>(
  State(store): State<Arc<S>>,
  Query(params): Query<ProfileParams>,
) -> Result<Json<UserProfile>, ApiError> {
  let profile = store.get_profile(params.user_id).await?.ok_or_else(|| {
    ApiError::NotFound(format!("no profile for user {}", params.user_id))
  })?;
  Ok(Json(profile))
}
