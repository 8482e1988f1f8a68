//! Customer-facing stores: secrets (C4), capabilities (C5), mapping (C6),
//! and the authenticator (C7) that ties them together with the identifier
//! codec (C2).

pub mod authenticator;
pub mod capabilities;
pub mod mapping;
pub mod secrets;

pub use authenticator::CustomerAuthenticator;
pub use capabilities::{CapabilitiesStore, CapabilityFlags, CustomerCapabilities};
pub use mapping::{Mapping, MappingStore};
pub use secrets::{CustomerSecret, SecretsStore};

/// Non-zero customer identifier; `0` denotes invalid throughout this crate.
pub type CustomerId = u32;

/// Sentinel for "no customer" / "invalid customer id".
pub const INVALID_CUSTOMER_ID: CustomerId = 0;

/// Server identifier used by the mapping store and fleet administrator.
pub type ServerId = u32;

/// Sentinel for "no server".
pub const INVALID_SERVER_ID: ServerId = 0;
