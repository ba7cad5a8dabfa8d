//! REST API for the registry engine
//!
//! Thin axum handlers over [`RegistryEngine`](crate::engine::RegistryEngine).
//! The caller identity arrives in request headers, set by the gateway in
//! front of this service.

pub mod registry_routes;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::ports::Actor;

pub use registry_routes::create_registry_router;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const TERRITORY_HEADER: &str = "x-territory-id";
pub const TERRITORIES_HEADER: &str = "x-territory-ids";
pub const ORGANIZATION_HEADER: &str = "x-organization-id";
pub const CLAIMS_HEADER: &str = "x-user-claims";

// ============================================================================
// Errors
// ============================================================================

/// [`RegistryError`] as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let RegistryError::Validation(issues) = &self.0 {
            body["issues"] = serde_json::json!(issues);
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Caller identity
// ============================================================================

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, ApiError> {
    header(headers, name)
        .map(|v| {
            Uuid::parse_str(v).map_err(|_| ApiError(RegistryError::InvalidQuery(format!("header {name} is not a uuid"))))
        })
        .transpose()
}

/// Build an [`Actor`] from gateway headers. Claims and territory ids are
/// comma separated.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let split = |name: &str| -> Vec<String> {
        header(headers, name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let territory_ids = split(TERRITORIES_HEADER)
        .iter()
        .map(|t| Uuid::parse_str(t))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ApiError(RegistryError::InvalidQuery(format!("header {TERRITORIES_HEADER} is malformed"))))?;

    Ok(Actor {
        user_id: header_uuid(headers, USER_ID_HEADER)?.unwrap_or_default(),
        full_name: header(headers, USER_NAME_HEADER).unwrap_or("anonymous").to_string(),
        territory_id: header_uuid(headers, TERRITORY_HEADER)?,
        territory_ids,
        organization_id: header_uuid(headers, ORGANIZATION_HEADER)?,
        claims: split(CLAIMS_HEADER),
    })
}

/// Extractor wrapper for the calling [`Actor`].
pub struct Caller(pub Actor);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers).map(Caller)
    }
}
