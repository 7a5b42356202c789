//! HTTP API.
//!
//! Thin axum layer over the position ledger: request parsing, opaque
//! identity extraction, and the error-to-status mapping. No business rules
//! live here.

mod identity;
mod routes;

pub use identity::{require_admin, require_owner, Actor, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER, OWNER_HEADER};
pub use routes::{create_router, AppState};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::errors::EngineError;

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
    Forbidden(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Engine(EngineError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            ApiError::Engine(EngineError::InsufficientFunds(msg)) => {
                (StatusCode::PAYMENT_REQUIRED, msg.clone())
            }
            ApiError::Engine(EngineError::NotFound(msg)) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Engine(EngineError::InvalidTransition(msg)) => {
                (StatusCode::CONFLICT, format!("invalid transition: {}", msg))
            }
            ApiError::Engine(EngineError::ConcurrencyConflict(msg)) => {
                (StatusCode::CONFLICT, msg.clone())
            }
            ApiError::Engine(EngineError::Internal(err)) => {
                tracing::error!("internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_conversion() {
        let err: ApiError = EngineError::Validation("amount".into()).into();
        match err {
            ApiError::Engine(EngineError::Validation(_)) => (),
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
