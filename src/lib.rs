//! # A website-monitoring control plane
//!
//! Tracks which customers are entitled to which monitoring features, which
//! polling servers they're assigned to, authenticates their inbound REST
//! calls, and rolls up the latency samples those polling servers report.
//!
//! ## Architecture
//!
//! - `cache`: open-addressing hash cache shared by the customer stores
//! - `crypto`: AES-256-CBC sealing for secrets at rest
//! - `identifier`: the reversible customer-id/identifier codec
//! - `database`: the per-thread SQLite connection multiplexer
//! - `customers`: capabilities, secrets, mapping, and the authenticator
//! - `fleet`: polling-server registry and outbound admin signaling
//! - `telemetry`: latency sample ingestion and rollup aggregation
//! - `config`: hot-reloading process configuration
//! - `api`: the inbound REST surface

#![warn(clippy::all)]

pub mod api;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod customers;
pub mod database;
pub mod fleet;
pub mod identifier;
pub mod telemetry;

pub use config::Config;

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
