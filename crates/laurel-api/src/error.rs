//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Engine errors carry their taxonomy class into the response body so
//! callers can branch on `class` (and `retryable`) instead of parsing
//! messages.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use laurel_core::ErrorClass;
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error(transparent)]
  Engine(#[from] laurel_core::Error),
}

fn status_for(class: ErrorClass) -> StatusCode {
  match class {
    ErrorClass::Validation => StatusCode::BAD_REQUEST,
    ErrorClass::NotFound => StatusCode::NOT_FOUND,
    // Both are transient races the caller is expected to retry.
    ErrorClass::LockContention | ErrorClass::Conflict => StatusCode::CONFLICT,
    ErrorClass::InsufficientState => StatusCode::UNPROCESSABLE_ENTITY,
    ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, class, message) = match &self {
      ApiError::BadRequest(m) => {
        (StatusCode::BAD_REQUEST, ErrorClass::Validation, m.clone())
      }
      ApiError::NotFound(m) => {
        (StatusCode::NOT_FOUND, ErrorClass::NotFound, m.clone())
      }
      ApiError::Engine(e) => {
        let class = e.class();
        (status_for(class), class, e.to_string())
      }
    };
    (
      status,
      Json(json!({
        "error": message,
        "class": class.as_str(),
        "retryable": class.is_retryable(),
      })),
    )
      .into_response()
  }
}
