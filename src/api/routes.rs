use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::positions::{AdminOverride, CreatePosition, Position, PositionLedger, PositionStatus};
use crate::wallet::{Wallet, WalletStore};

use super::identity::{require_admin, require_owner};
use super::ApiError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<PositionLedger>,
    pub wallets: Arc<WalletStore>,
}

/// Create the API router
pub fn create_router(ledger: Arc<PositionLedger>, wallets: Arc<WalletStore>) -> Router {
    let state = AppState { ledger, wallets };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/positions", post(create_position).get(list_positions))
        .route("/api/positions/recompute-all", post(recompute_all))
        .route("/api/positions/:id", get(get_position))
        .route("/api/positions/:id/recompute", post(recompute_position))
        .route("/api/admin/positions/:id", put(admin_update_position))
        .route("/api/wallets/:owner_id", get(get_wallet))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Open a new commitment for the session's owner
async fn create_position(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePositionBody>,
) -> Result<Json<Position>, ApiError> {
    let owner_id = require_owner(&headers)?;
    let req = CreatePosition {
        owner_id,
        kind: body.kind,
        reference_id: body.reference_id,
        amount: body.amount,
        allocation_percent: body.allocation_percent,
    };
    let pos = state.ledger.create(req).await?;
    Ok(Json(pos))
}

/// List the session owner's positions with an optional status filter
async fn list_positions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListQuery>,
) -> Result<Json<PositionsResponse>, ApiError> {
    let owner_id = require_owner(&headers)?;
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            PositionStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {}", raw)))?,
        ),
        None => None,
    };
    let positions = state.ledger.list(&owner_id, status).await?;
    Ok(Json(PositionsResponse {
        count: positions.len(),
        positions,
    }))
}

/// Fetch one position, recomputing accrual lazily
async fn get_position(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Position>, ApiError> {
    Ok(Json(state.ledger.get(&id).await?))
}

/// Recompute a single position's accrual, optionally at a fixed instant
async fn recompute_position(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RecomputeQuery>,
) -> Result<Json<Position>, ApiError> {
    let as_of = parse_as_of(params.as_of.as_deref())?;
    Ok(Json(state.ledger.recompute_at(&id, as_of).await?))
}

/// Recompute every active position
async fn recompute_all(
    State(state): State<AppState>,
    Query(params): Query<RecomputeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let as_of = parse_as_of(params.as_of.as_deref())?;
    let refreshed = state.ledger.recompute_all(as_of).await?;
    Ok(Json(json!({ "refreshed": refreshed })))
}

/// Constrained, audited override path for support staff
async fn admin_update_position(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<AdminOverride>,
) -> Result<Json<Position>, ApiError> {
    let actor = require_admin(&headers)?;
    let pos = state.ledger.admin_update(&id, update, &actor.id).await?;
    Ok(Json(pos))
}

/// Wallet balance read-through
async fn get_wallet(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<Wallet>, ApiError> {
    state
        .wallets
        .get_wallet(&owner_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::Engine(crate::errors::EngineError::NotFound(format!(
                "wallet {}",
                owner_id
            )))
        })
}

fn parse_as_of(raw: Option<&str>) -> Result<DateTime<Utc>, ApiError> {
    match raw {
        None => Ok(Utc::now()),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ApiError::BadRequest(format!("as_of is not RFC 3339: {}", raw))),
    }
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct CreatePositionBody {
    /// "plan-investment" or "copy-trade"
    kind: String,
    reference_id: String,
    amount: f64,
    #[serde(default)]
    allocation_percent: Option<f64>,
}

#[derive(Deserialize)]
struct ListQuery {
    /// Filter by status ("active", "completed", "cancelled")
    status: Option<String>,
}

#[derive(Deserialize)]
struct RecomputeQuery {
    /// RFC 3339 evaluation instant; defaults to now
    as_of: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct PositionsResponse {
    count: usize,
    positions: Vec<Position>,
}
