//! Opaque identity extraction.
//!
//! The session collaborator in front of this service resolves users and
//! staff; we only read its headers. Owner ids and actor roles are never
//! interpreted beyond the admin gate.

use axum::http::HeaderMap;

use super::ApiError;

pub const OWNER_HEADER: &str = "x-owner-id";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub role: String,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn require_owner(headers: &HeaderMap) -> Result<String, ApiError> {
    header_value(headers, OWNER_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", OWNER_HEADER)))
}

pub fn require_admin(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let id = header_value(headers, ACTOR_ID_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {} header", ACTOR_ID_HEADER)))?;
    let role = header_value(headers, ACTOR_ROLE_HEADER).unwrap_or_default();
    let actor = Actor { id, role };
    if !actor.is_admin() {
        return Err(ApiError::Forbidden("admin role required".into()));
    }
    Ok(actor)
}
