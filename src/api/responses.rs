//! Wire response shape for the inbound REST surface (C10).
//!
//! Every endpoint answers with the plain `{"status": "OK", ...}` /
//! `{"status": "failed, <reason>"}` shape named in `SPEC_FULL.md` §6/§10 —
//! not the RFC 7807 envelope the rest of this crate's scaffolding carries
//! for other purposes. A single [`ApiError`] converges every subsystem
//! error onto this shape at the HTTP boundary, per §7.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::customers::capabilities::CapabilitiesError;
use crate::customers::mapping::MappingError;
use crate::customers::secrets::SecretsError;
use crate::database::DatabaseError;
use crate::telemetry::AggregatorError;

/// The body shape for every C10 response.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self { status: "OK".to_string(), extra: Map::new() }
    }

    /// `status: "OK"` plus additional top-level fields.
    pub fn ok_with(fields: Value) -> Self {
        let extra = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { status: "OK".to_string(), extra }
    }

    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self { status: format!("failed, {reason}"), extra: Map::new() }
    }
}

impl IntoResponse for StatusResponse {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Every error kind named in §7, converging here into one `IntoResponse`.
#[derive(Debug)]
pub enum ApiError {
    /// Bad field in the request body → HTTP 400.
    Validation(String),
    /// Unknown identifier, bad signature, or wrong capability → HTTP 401.
    Authentication,
    /// Entity absent → HTTP 200 with a `"failed, unknown …"` body.
    NotFound(String),
    /// DB open/prepare/exec failure → logged, HTTP 200 with a `"failed, …"` body.
    Storage(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Validation(reason) => write!(f, "{reason}"),
            ApiError::Authentication => write!(f, "unauthorized"),
            ApiError::NotFound(reason) => write!(f, "{reason}"),
            ApiError::Storage(reason) => write!(f, "{reason}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Authentication => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) | ApiError::Storage(_) => StatusCode::OK,
        };

        if let ApiError::Storage(reason) = &self {
            tracing::error!(%reason, "storage error at the REST boundary");
        }

        (status_code, StatusResponse::failed(&self)).into_response()
    }
}

impl From<CapabilitiesError> for ApiError {
    fn from(error: CapabilitiesError) -> Self {
        let CapabilitiesError::Database(db) = error;
        ApiError::from(db)
    }
}

impl From<SecretsError> for ApiError {
    fn from(error: SecretsError) -> Self {
        match error {
            SecretsError::Database(db) => ApiError::from(db),
            SecretsError::Cbc(e) => ApiError::Storage(e.to_string()),
            SecretsError::CorruptSecret => ApiError::Storage("stored secret is corrupt".to_string()),
        }
    }
}

impl From<MappingError> for ApiError {
    fn from(error: MappingError) -> Self {
        let MappingError::Database(db) = error;
        ApiError::from(db)
    }
}

impl From<AggregatorError> for ApiError {
    fn from(error: AggregatorError) -> Self {
        let AggregatorError::Database(db) = error;
        ApiError::from(db)
    }
}

impl From<DatabaseError> for ApiError {
    fn from(error: DatabaseError) -> Self {
        ApiError::Storage(error.to_string())
    }
}
