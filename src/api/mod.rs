//! Inbound REST surface (C10): admin and customer-facing endpoints over
//! C4–C9, layered with the two HMAC authentication regimes.
//!
//! Responses are a flat `{"status": "OK"/"failed, <reason>"}` shape rather
//! than an RFC 7807 problem envelope; see `responses` for the mapping from
//! subsystem errors to HTTP status.

pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod routes;
pub mod state;

pub use responses::{ApiError, StatusResponse};
pub use routes::build_router;
pub use state::AppState;
