//! JSON RPC-style API for Laurel.
//!
//! Exposes an axum [`Router`] backed by any [`laurel_core::store::XpStore`].
//! Auth, TLS, and transport concerns are the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/rpc", laurel_api::api_router(store.clone()))
//! ```

pub mod achievements;
pub mod admin;
pub mod error;
pub mod xp;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use laurel_core::store::XpStore;

pub use error::ApiError;

/// Build a fully-materialised API router for `store`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S>(store: Arc<S>) -> Router<()>
where
  S: XpStore + 'static,
{
  Router::new()
    // Crediting
    .route("/rpc/credit_xp", post(xp::credit::<S>))
    .route("/rpc/credit_xp_safe", post(xp::credit_safe::<S>))
    // Reads
    .route("/rpc/compute_level_info", get(xp::level_info::<S>))
    .route("/rpc/get_active_xp_sources", get(xp::active_sources::<S>))
    .route("/rpc/get_xp_events", get(xp::events::<S>))
    .route("/rpc/get_user_profile", get(xp::profile::<S>))
    // Achievements
    .route("/rpc/unlock_achievement", post(achievements::unlock::<S>))
    .route(
      "/rpc/unlock_achievement_safe",
      post(achievements::unlock_safe::<S>),
    )
    .route("/rpc/get_achievement", get(achievements::get_one::<S>))
    .route(
      "/rpc/get_user_achievements",
      get(achievements::list::<S>),
    )
    // Administration
    .route("/rpc/define_xp_source", post(admin::define_source::<S>))
    .route(
      "/rpc/define_achievement",
      post(admin::define_achievement::<S>),
    )
    .route(
      "/rpc/admin_compensate_achievement",
      post(admin::compensate::<S>),
    )
    .route(
      "/rpc/recalculate_user_xp_after_achievement_removal",
      post(admin::recalculate_after_achievement_removal::<S>),
    )
    .route(
      "/rpc/recalculate_user_xp_after_source_removal",
      post(admin::recalculate_after_source_removal::<S>),
    )
    .route("/rpc/sync_achievement_xp", post(admin::sync::<S>))
    .with_state(store)
}
