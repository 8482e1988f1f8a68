//! Fleet orchestration (C8): assigns customers to polling servers and
//! propagates capability/lifecycle changes to them.

pub mod administrator;
pub mod client;

pub use administrator::{ServerAdministrator, ServerRegistry};
pub use client::{FleetError, PollingServerClient, PollingServerConfig};
