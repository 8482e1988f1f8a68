//! Admin and customer request handlers for C10: thin JSON (and one binary)
//! handlers that validate, then call C4–C9 directly.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{body::Bytes, Extension, Json};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::api::middleware::CustomerIdentity;
use crate::api::responses::{ApiError, StatusResponse};
use crate::api::state::AppState;
use crate::customers::capabilities::{CapabilityFlags, CustomerCapabilities};
use crate::customers::mapping::Mapping;
use crate::customers::{CustomerId, INVALID_CUSTOMER_ID};
use crate::identifier;
use crate::telemetry::{summarize, RawSample};

fn require_customer_id(customer_id: CustomerId) -> Result<CustomerId, ApiError> {
    if customer_id == INVALID_CUSTOMER_ID {
        Err(ApiError::Validation("invalid customer id".to_string()))
    } else {
        Ok(customer_id)
    }
}

// ---------------------------------------------------------------------
// admin: /customer/*
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CustomerCreateRequest {
    pub customer_id: CustomerId,
    pub maximum_number_monitors: u16,
    pub polling_interval: u16,
    pub expiration_days: u32,
    #[serde(default)]
    pub customer_active: bool,
    #[serde(default)]
    pub multi_region_checking: bool,
    #[serde(default)]
    pub supports_word_press: bool,
    #[serde(default)]
    pub supports_rest_api: bool,
    #[serde(default)]
    pub supports_content_checking: bool,
    #[serde(default)]
    pub supports_keyword_checking: bool,
    #[serde(default)]
    pub supports_post_method: bool,
    #[serde(default)]
    pub supports_latency_tracking: bool,
    #[serde(default)]
    pub supports_ssl_expiration_checking: bool,
    #[serde(default)]
    pub supports_ping_based_polling: bool,
    #[serde(default)]
    pub supports_blacklist_checking: bool,
    #[serde(default)]
    pub supports_domain_expiration_checking: bool,
    #[serde(default)]
    pub supports_maintenance_mode: bool,
    #[serde(default)]
    pub supports_rollups: bool,
    #[serde(default)]
    pub paused: bool,
}

fn flags_from_create_request(request: &CustomerCreateRequest) -> CapabilityFlags {
    let mut flags = CapabilityFlags(0);
    flags.set(CapabilityFlags::CUSTOMER_ACTIVE, request.customer_active);
    flags.set(CapabilityFlags::MULTI_REGION_CHECKING, request.multi_region_checking);
    flags.set(CapabilityFlags::SUPPORTS_WORDPRESS, request.supports_word_press);
    flags.set(CapabilityFlags::SUPPORTS_REST_API, request.supports_rest_api);
    flags.set(CapabilityFlags::SUPPORTS_CONTENT_CHECKING, request.supports_content_checking);
    flags.set(CapabilityFlags::SUPPORTS_KEYWORD_CHECKING, request.supports_keyword_checking);
    flags.set(CapabilityFlags::SUPPORTS_POST_METHOD, request.supports_post_method);
    flags.set(CapabilityFlags::SUPPORTS_LATENCY_TRACKING, request.supports_latency_tracking);
    flags.set(CapabilityFlags::SUPPORTS_SSL_EXPIRATION_CHECKING, request.supports_ssl_expiration_checking);
    flags.set(CapabilityFlags::SUPPORTS_PING_BASED_POLLING, request.supports_ping_based_polling);
    flags.set(CapabilityFlags::SUPPORTS_BLACKLIST_CHECKING, request.supports_blacklist_checking);
    flags.set(CapabilityFlags::SUPPORTS_DOMAIN_EXPIRATION_CHECKING, request.supports_domain_expiration_checking);
    flags.set(CapabilityFlags::SUPPORTS_MAINTENANCE_MODE, request.supports_maintenance_mode);
    flags.set(CapabilityFlags::SUPPORTS_ROLLUPS, request.supports_rollups);
    flags.set(CapabilityFlags::PAUSED, request.paused);
    flags
}

fn capabilities_json(caps: &CustomerCapabilities) -> serde_json::Value {
    json!({
        "customer_id": caps.customer_id,
        "maximum_number_monitors": caps.max_monitors,
        "polling_interval": caps.polling_interval,
        "expiration_days": caps.expiration_days,
        "customer_active": caps.customer_active(),
        "multi_region_checking": caps.flags.has(CapabilityFlags::MULTI_REGION_CHECKING),
        "supports_word_press": caps.supports_word_press(),
        "supports_rest_api": caps.supports_rest_api(),
        "paused": caps.flags.has(CapabilityFlags::PAUSED),
    })
}

pub async fn customer_create(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerCreateRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let flags = flags_from_create_request(&request);
    let caps = CustomerCapabilities {
        customer_id: request.customer_id,
        max_monitors: request.maximum_number_monitors,
        polling_interval: request.polling_interval,
        expiration_days: request.expiration_days,
        flags,
    };
    state.capabilities.update(caps, state.next_thread_id()).await?;
    Ok(StatusResponse::ok())
}

#[derive(Debug, Deserialize)]
pub struct CustomerIdRequest {
    pub customer_id: CustomerId,
}

pub async fn customer_get(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerIdRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let caps = state
        .capabilities
        .get(request.customer_id, false, state.next_thread_id())
        .await?
        .ok_or_else(|| ApiError::NotFound("unknown customer id".to_string()))?;
    Ok(StatusResponse::ok_with(capabilities_json(&caps)))
}

pub async fn customer_delete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerIdRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let thread_id = state.next_thread_id();
    state.capabilities.delete(request.customer_id, thread_id).await?;
    state.secrets.delete(request.customer_id, thread_id).await?;
    state.mapping.update_mapping(request.customer_id, &Mapping::default(), thread_id).await?;
    Ok(StatusResponse::ok())
}

#[derive(Debug, Deserialize)]
pub struct CustomerPurgeRequest {
    pub customer_ids: Vec<CustomerId>,
}

/// §9 open question (a): the malformed `"failed, could not deactivate
/// customer %1)invalid customer ID"` message is replaced with plain text;
/// the code path (reject, don't half-purge) is unchanged.
pub async fn customer_purge(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerPurgeRequest>,
) -> Result<StatusResponse, ApiError> {
    if request.customer_ids.iter().any(|&id| id == INVALID_CUSTOMER_ID) {
        return Err(ApiError::Validation("invalid customer id".to_string()));
    }

    let thread_id = state.next_thread_id();
    state.capabilities.purge(&request.customer_ids, thread_id).await?;
    for &customer_id in &request.customer_ids {
        state.secrets.delete(customer_id, thread_id).await?;
        state.mapping.update_mapping(customer_id, &Mapping::default(), thread_id).await?;
    }
    Ok(StatusResponse::ok())
}

pub async fn customer_list(State(state): State<Arc<AppState>>) -> Result<StatusResponse, ApiError> {
    let all = state.capabilities.get_all(state.next_thread_id()).await?;
    let customers: Vec<_> = all.iter().map(capabilities_json).collect();
    Ok(StatusResponse::ok_with(json!({ "customers": customers })))
}

pub async fn customer_get_secret(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerIdRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let thread_id = state.next_thread_id();
    let secret = match state.secrets.get(request.customer_id, false, thread_id).await? {
        Some(secret) => secret,
        None => state.secrets.rotate(request.customer_id, thread_id).await?,
    };
    Ok(secret_response(&state, request.customer_id, secret.secret()))
}

pub async fn customer_reset_secret(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerIdRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let secret = state.secrets.rotate(request.customer_id, state.next_thread_id()).await?;
    Ok(secret_response(&state, request.customer_id, secret.secret()))
}

fn secret_response(state: &AppState, customer_id: CustomerId, secret: &[u8]) -> StatusResponse {
    let identifier = identifier::to_identifier(customer_id, &state.identifier_key);
    StatusResponse::ok_with(json!({
        "identifier": format!("{identifier:016x}"),
        "secret": BASE64.encode(secret),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CustomerPauseRequest {
    pub customer_id: CustomerId,
    pub paused: bool,
}

pub async fn customer_pause(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerPauseRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let ok = state
        .administrator
        .set_paused(request.customer_id, request.paused, state.next_thread_id())
        .await;
    if ok {
        Ok(StatusResponse::ok())
    } else {
        Ok(StatusResponse::failed("could not update pause state"))
    }
}

// ---------------------------------------------------------------------
// admin: /mapping/*
// ---------------------------------------------------------------------

pub async fn mapping_get(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerIdRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let mapping = state.mapping.mapping(request.customer_id, state.next_thread_id()).await?;
    Ok(StatusResponse::ok_with(json!({
        "primary_server_id": mapping.primary_server_id(),
        "servers": mapping.servers().iter().copied().collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct MappingUpdateRequest {
    pub customer_id: CustomerId,
    pub servers: Vec<u32>,
    #[serde(default)]
    pub primary_server_id: Option<u32>,
}

/// §9/§10 open question (b): the caller-declared primary is honored when
/// it is present in the supplied server set; otherwise the first server
/// in the request becomes primary.
pub async fn mapping_update(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MappingUpdateRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    if request.servers.is_empty() {
        return Err(ApiError::Validation("mapping must include at least one server".to_string()));
    }

    let primary = match request.primary_server_id {
        Some(id) if request.servers.contains(&id) => id,
        _ => request.servers[0],
    };

    let mapping = Mapping::new(primary, request.servers.into_iter().collect());
    state.mapping.update_mapping(request.customer_id, &mapping, state.next_thread_id()).await?;
    Ok(StatusResponse::ok_with(json!({
        "primary_server_id": mapping.primary_server_id(),
        "servers": mapping.servers().iter().copied().collect::<Vec<_>>(),
    })))
}

pub async fn mapping_customer_activate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerIdRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let ok = state.administrator.activate_customer(request.customer_id, state.next_thread_id()).await;
    if ok {
        Ok(StatusResponse::ok())
    } else {
        Ok(StatusResponse::failed("could not activate customer"))
    }
}

pub async fn mapping_customer_deactivate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CustomerIdRequest>,
) -> Result<StatusResponse, ApiError> {
    require_customer_id(request.customer_id)?;
    let ok = state.administrator.deactivate_customer(request.customer_id, state.next_thread_id()).await;
    if ok {
        Ok(StatusResponse::ok())
    } else {
        Ok(StatusResponse::failed("could not deactivate customer"))
    }
}

#[derive(Debug, Deserialize)]
pub struct MappingListQuery {
    pub server_id: Option<u32>,
}

pub async fn mapping_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MappingListQuery>,
) -> Result<StatusResponse, ApiError> {
    let mappings = state.mapping.mappings(query.server_id, state.next_thread_id()).await?;
    let entries: Vec<_> = mappings
        .into_iter()
        .map(|(customer_id, mapping)| {
            json!({
                "customer_id": customer_id,
                "primary_server_id": mapping.primary_server_id(),
                "servers": mapping.servers().iter().copied().collect::<Vec<_>>(),
            })
        })
        .collect();
    Ok(StatusResponse::ok_with(json!({ "mappings": entries })))
}

// ---------------------------------------------------------------------
// admin: /latency/*
// ---------------------------------------------------------------------

const LATENCY_HEADER_LEN: usize = 64;
const LATENCY_ENTRY_LEN: usize = 12;

/// Parse and ingest the packed binary wire format from §6: a 64-byte header
/// followed by 12-byte `(monitorId, timestamp, latencyMicroseconds)`
/// entries, all little-endian. The polling server's 48-byte identity token
/// is not resolved against a server directory in this implementation (no
/// server-identity store exists in scope); its first four bytes are read
/// as the little-endian `serverId`, matching the convention the rest of
/// this crate uses for fixed-width ids (see `DESIGN.md`).
pub async fn latency_record(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<StatusResponse, ApiError> {
    if body.len() < LATENCY_HEADER_LEN {
        return Err(ApiError::Validation("latency payload shorter than the header".to_string()));
    }
    let (header, entries) = body.split_at(LATENCY_HEADER_LEN);
    if entries.len() % LATENCY_ENTRY_LEN != 0 {
        return Err(ApiError::Validation("latency entries are not a multiple of 12 bytes".to_string()));
    }

    let server_id = u32::from_le_bytes(header[2..6].try_into().expect("slice of len 4"));

    let samples: Vec<RawSample> = entries
        .chunks_exact(LATENCY_ENTRY_LEN)
        .map(|chunk| RawSample {
            monitor_id: u32::from_le_bytes(chunk[0..4].try_into().expect("slice of len 4")),
            server_id,
            timestamp: u32::from_le_bytes(chunk[4..8].try_into().expect("slice of len 4")),
            latency_microseconds: u32::from_le_bytes(chunk[8..12].try_into().expect("slice of len 4")),
        })
        .collect();

    state.aggregator.record(&samples, state.next_thread_id()).await?;
    Ok(StatusResponse::ok_with(json!({ "accepted": samples.len() })))
}

#[derive(Debug, Deserialize)]
pub struct LatencyQuery {
    pub monitor_id: u32,
    pub server_id: Option<u32>,
    pub since: Option<u32>,
    pub until: Option<u32>,
}

pub async fn latency_get(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatencyQuery>,
) -> Result<StatusResponse, ApiError> {
    let buckets = state
        .aggregator
        .query(query.monitor_id, query.server_id, query.since, query.until, state.next_thread_id())
        .await?;
    let rows: Vec<_> = buckets
        .iter()
        .map(|bucket| {
            json!({
                "server_id": bucket.server_id,
                "bucket_start": bucket.bucket_start,
                "count": bucket.count,
                "mean": bucket.mean,
                "variance_sum": bucket.variance_sum,
                "min": bucket.min,
                "max": bucket.max,
            })
        })
        .collect();
    Ok(StatusResponse::ok_with(json!({ "buckets": rows })))
}

pub async fn latency_statistics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatencyQuery>,
) -> Result<StatusResponse, ApiError> {
    let buckets = state
        .aggregator
        .query(query.monitor_id, query.server_id, query.since, query.until, state.next_thread_id())
        .await?;
    match summarize(&buckets) {
        Some(summary) => Ok(StatusResponse::ok_with(json!({
            "count": summary.count,
            "mean": summary.mean,
            "variance_sum": summary.variance_sum,
            "min": summary.min,
            "max": summary.max,
        }))),
        None => Ok(StatusResponse::ok_with(json!({ "count": 0 }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct LatencyPurgeRequest {
    pub monitor_ids: Vec<u32>,
}

pub async fn latency_purge(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LatencyPurgeRequest>,
) -> Result<StatusResponse, ApiError> {
    state.aggregator.delete_by_customer_id(&[], &request.monitor_ids, state.next_thread_id()).await?;
    Ok(StatusResponse::ok())
}

// ---------------------------------------------------------------------
// customer-facing: /v1/*
// ---------------------------------------------------------------------

pub async fn v1_capabilities_get(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<CustomerIdentity>,
) -> Result<StatusResponse, ApiError> {
    let caps = state
        .capabilities
        .get(identity.0, false, state.next_thread_id())
        .await?
        .ok_or_else(|| ApiError::NotFound("unknown customer id".to_string()))?;
    Ok(StatusResponse::ok_with(capabilities_json(&caps)))
}

#[derive(Debug, Deserialize)]
pub struct V1PauseRequest {
    pub paused: bool,
}

pub async fn v1_customer_pause(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<CustomerIdentity>,
    Json(request): Json<V1PauseRequest>,
) -> Result<StatusResponse, ApiError> {
    let ok = state.administrator.set_paused(identity.0, request.paused, state.next_thread_id()).await;
    if ok {
        Ok(StatusResponse::ok())
    } else {
        Ok(StatusResponse::failed("could not update pause state"))
    }
}

pub async fn not_found() -> (StatusCode, StatusResponse) {
    (StatusCode::NOT_FOUND, StatusResponse::failed("unknown route"))
}
