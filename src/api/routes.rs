//! Router assembly for C10: an admin tree signed with the process-wide key,
//! mounted at the bare paths the wire contract names, and a customer-facing
//! `/v1` tree signed per-customer.

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    customer_create, customer_delete, customer_get, customer_get_secret, customer_list,
    customer_pause, customer_purge, customer_reset_secret, latency_get, latency_purge,
    latency_record, latency_statistics, mapping_customer_activate, mapping_customer_deactivate,
    mapping_get, mapping_list, mapping_update, not_found, v1_capabilities_get, v1_customer_pause,
};
use super::middleware::{
    admin_auth_middleware, customer_auth_middleware_rest, customer_auth_middleware_word_press,
};
use super::state::AppState;

fn admin_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/customer/get", post(customer_get))
        .route("/customer/create", post(customer_create))
        .route("/customer/delete", post(customer_delete))
        .route("/customer/purge", post(customer_purge))
        .route("/customer/list", get(customer_list))
        .route("/customer/get_secret", post(customer_get_secret))
        .route("/customer/reset_secret", post(customer_reset_secret))
        .route("/customer/pause", post(customer_pause))
        .route("/mapping/get", post(mapping_get))
        .route("/mapping/update", post(mapping_update))
        .route("/mapping/customer/activate", post(mapping_customer_activate))
        .route("/mapping/customer/deactivate", post(mapping_customer_deactivate))
        .route("/mapping/list", get(mapping_list))
        .route("/latency/record", post(latency_record))
        .route("/latency/get", get(latency_get))
        .route("/latency/purge", post(latency_purge))
        .route("/latency/statistics", get(latency_statistics))
        .layer(from_fn_with_state(state, admin_auth_middleware))
}

/// `/v1/capabilities/get` is read-only telemetry a customer's own REST
/// integration pulls; it carries the restrictive, REST-only policy.
fn v1_rest_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/capabilities/get", get(v1_capabilities_get))
        .layer(from_fn_with_state(state, customer_auth_middleware_rest))
}

/// `/v1/customer/pause` is also driven by the WordPress plugin on the
/// customer's behalf, so it carries the permissive policy.
fn v1_word_press_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/customer/pause", post(v1_customer_pause))
        .layer(from_fn_with_state(state, customer_auth_middleware_word_press))
}

fn v1_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(v1_rest_router(state.clone()))
        .merge(v1_word_press_router(state))
}

/// Assemble the full router: health check, admin routes at root, and the
/// customer tree under `/v1`, wrapped with tracing and a permissive CORS
/// policy.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .merge(admin_router(state.clone()))
        .nest("/v1", v1_router(state.clone()))
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
