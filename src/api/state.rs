//! Shared application state handed to every C10 handler: the stores and
//! collaborators assembled at startup in `main.rs`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::customers::{CapabilitiesStore, CustomerAuthenticator, MappingStore, SecretsStore};
use crate::fleet::ServerAdministrator;
use crate::identifier::IdentifierKey;
use crate::telemetry::LatencyAggregator;

/// Everything a handler needs, wired together once at process startup.
pub struct AppState {
    pub capabilities: Arc<CapabilitiesStore>,
    pub secrets: Arc<SecretsStore>,
    pub mapping: Arc<MappingStore>,
    pub administrator: Arc<ServerAdministrator>,
    pub aggregator: Arc<LatencyAggregator>,
    /// Restrictive, REST-only authenticator — guards endpoints that only
    /// the customer's own REST integration should reach.
    pub authenticator_rest: Arc<CustomerAuthenticator>,
    /// Permissive, WordPress + REST authenticator — guards endpoints the
    /// WordPress plugin also calls on the customer's behalf.
    pub authenticator_word_press: Arc<CustomerAuthenticator>,
    pub identifier_key: IdentifierKey,
    pub inbound_api_key: Vec<u8>,
    thread_counter: AtomicU32,
    thread_pool_size: u32,
}

impl AppState {
    pub fn new(
        capabilities: Arc<CapabilitiesStore>,
        secrets: Arc<SecretsStore>,
        mapping: Arc<MappingStore>,
        administrator: Arc<ServerAdministrator>,
        aggregator: Arc<LatencyAggregator>,
        authenticator_rest: Arc<CustomerAuthenticator>,
        authenticator_word_press: Arc<CustomerAuthenticator>,
        identifier_key: IdentifierKey,
        inbound_api_key: Vec<u8>,
        thread_pool_size: u32,
    ) -> Self {
        Self {
            capabilities,
            secrets,
            mapping,
            administrator,
            aggregator,
            authenticator_rest,
            authenticator_word_press,
            identifier_key,
            inbound_api_key,
            thread_counter: AtomicU32::new(0),
            thread_pool_size: thread_pool_size.max(1),
        }
    }

    /// Round-robin a `threadId` across the configured connection slots for
    /// this request, per the per-thread multiplexer contract in §4.3/§5.
    pub fn next_thread_id(&self) -> u32 {
        self.thread_counter.fetch_add(1, Ordering::Relaxed) % self.thread_pool_size
    }
}
