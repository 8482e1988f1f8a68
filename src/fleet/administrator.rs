//! Server administrator (C8): decides which polling servers serve a
//! customer, keeps C6 in sync, and fans out customer lifecycle events to
//! the affected servers.

use crate::customers::capabilities::CapabilityFlags;
use crate::customers::mapping::{Mapping, MappingStore};
use crate::customers::{CapabilitiesStore, CustomerId, ServerId};
use crate::fleet::client::PollingServerClient;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Maps a `ServerId` to the host address `PollingServerClient` dials.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    hosts: HashMap<ServerId, String>,
}

impl ServerRegistry {
    pub fn new(hosts: HashMap<ServerId, String>) -> Self {
        Self { hosts }
    }

    pub fn host(&self, server_id: ServerId) -> Option<&str> {
        self.hosts.get(&server_id).map(String::as_str)
    }

    /// All known server ids, in ascending order, for deterministic
    /// placement decisions.
    fn ordered_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.hosts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Desired server set for a customer: every registered server when
    /// `multi_region` is requested, otherwise just the lowest-numbered
    /// (and therefore first-registered) one. Either way the first id
    /// chosen becomes the primary per §4.8's election rule.
    fn placement_for(&self, multi_region: bool) -> Mapping {
        let ids = self.ordered_ids();
        let Some(&primary) = ids.first() else {
            return Mapping::default();
        };

        if multi_region {
            Mapping::new(primary, ids.into_iter().collect())
        } else {
            Mapping::new(primary, HashSet::from([primary]))
        }
    }
}

/// Coordinates C6 (mapping) and the outbound client to keep the fleet in
/// sync with customer lifecycle and capability changes.
pub struct ServerAdministrator {
    mapping: Arc<MappingStore>,
    capabilities: Arc<CapabilitiesStore>,
    client: PollingServerClient,
    registry: ServerRegistry,
}

impl ServerAdministrator {
    pub fn new(
        mapping: Arc<MappingStore>,
        capabilities: Arc<CapabilitiesStore>,
        client: PollingServerClient,
        registry: ServerRegistry,
    ) -> Self {
        Self {
            mapping,
            capabilities,
            client,
            registry,
        }
    }

    /// Compute the desired server set, overwrite C6, and fan out
    /// `customer/add` to every affected server. Overall success requires
    /// the mapping write to succeed and the primary to be reachable; a
    /// secondary's failure is logged but does not fail the call.
    pub async fn activate_customer(&self, customer_id: CustomerId, thread_id: u32) -> bool {
        let Ok(Some(capabilities)) = self.capabilities.get(customer_id, false, thread_id).await else {
            tracing::warn!(customer_id, "activateCustomer: no capabilities on file");
            return false;
        };

        let multi_region = capabilities.flags.has(CapabilityFlags::MULTI_REGION_CHECKING);
        let mapping = self.registry.placement_for(multi_region);
        if !mapping.is_valid() {
            tracing::warn!(customer_id, "activateCustomer: no polling servers registered");
            return false;
        }

        if self.mapping.update_mapping(customer_id, &mapping, thread_id).await.is_err() {
            tracing::warn!(customer_id, "activateCustomer: failed to write mapping");
            return false;
        }

        let payload = json!({
            "customer_id": customer_id,
            "max_monitors": capabilities.max_monitors,
            "polling_interval": capabilities.polling_interval,
            "flags": capabilities.flags.0,
        });

        let mut primary_ok = false;
        for (i, server_id) in mapping.servers().iter().copied().enumerate() {
            let Some(host) = self.registry.host(server_id) else {
                continue;
            };
            let ok = self.client.post(host, "/customer/add", &payload).await.is_ok();
            if server_id == mapping.primary_server_id() {
                primary_ok = ok;
            }
            if !ok {
                tracing::warn!(customer_id, server_id, attempt = i, "customer/add failed");
            }
        }

        primary_ok
    }

    /// Fan out `customer/remove` to every server recorded for the
    /// customer; succeeds when the primary acknowledges.
    pub async fn deactivate_customer(&self, customer_id: CustomerId, thread_id: u32) -> bool {
        let Ok(mapping) = self.mapping.mapping(customer_id, thread_id).await else {
            return false;
        };
        if !mapping.is_valid() {
            return false;
        }

        let payload = json!({ "customer_id": customer_id });
        let mut primary_ok = false;
        for server_id in mapping.servers().iter().copied() {
            let Some(host) = self.registry.host(server_id) else {
                continue;
            };
            let ok = self.client.post(host, "/customer/remove", &payload).await.is_ok();
            if server_id == mapping.primary_server_id() {
                primary_ok = ok;
            }
        }
        primary_ok
    }

    /// Update the `paused` flag in C5 and fan out `customer/pause`.
    pub async fn set_paused(&self, customer_id: CustomerId, paused: bool, thread_id: u32) -> bool {
        let Ok(Some(mut capabilities)) = self.capabilities.get(customer_id, false, thread_id).await else {
            return false;
        };
        capabilities.flags.set(CapabilityFlags::PAUSED, paused);

        if self.capabilities.update(capabilities, thread_id).await.is_err() {
            return false;
        }

        let Ok(mapping) = self.mapping.mapping(customer_id, thread_id).await else {
            return false;
        };

        let payload = json!({ "customer_id": customer_id, "paused": paused });
        let mut primary_ok = !mapping.is_valid();
        for server_id in mapping.servers().iter().copied() {
            let Some(host) = self.registry.host(server_id) else {
                continue;
            };
            let ok = self.client.post(host, "/customer/pause", &payload).await.is_ok();
            if server_id == mapping.primary_server_id() {
                primary_ok = ok;
            }
        }
        primary_ok
    }

    /// One-shot startup replay: send `customer/add` for every active
    /// customer to its recorded mapping, `batch_size` at a time.
    pub async fn send_go_active(&self, batch_size: usize, thread_id: u32) {
        let Ok(all) = self.capabilities.get_all(thread_id).await else {
            tracing::error!("sendGoActive: failed to load capabilities");
            return;
        };

        let active: Vec<_> = all
            .into_iter()
            .filter(|c| c.flags.has(CapabilityFlags::CUSTOMER_ACTIVE))
            .collect();

        for chunk in active.chunks(batch_size.max(1)) {
            for capabilities in chunk {
                let Ok(mapping) = self.mapping.mapping(capabilities.customer_id, thread_id).await else {
                    continue;
                };
                if !mapping.is_valid() {
                    continue;
                }

                let payload = json!({
                    "customer_id": capabilities.customer_id,
                    "max_monitors": capabilities.max_monitors,
                    "polling_interval": capabilities.polling_interval,
                    "flags": capabilities.flags.0,
                });

                for server_id in mapping.servers().iter().copied() {
                    if let Some(host) = self.registry.host(server_id) {
                        let _ = self.client.post(host, "/customer/add", &payload).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customers::capabilities::CustomerCapabilities;
    use crate::customers::mapping::MappingStore;
    use crate::database::{ConnectionMultiplexer, DatabaseConfig};
    use crate::fleet::client::PollingServerConfig;
    use axum::routing::post;
    use axum::Router as AxumRouter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    async fn fixture() -> (CapabilitiesStore, MappingStore) {
        let mux = StdArc::new(
            ConnectionMultiplexer::new(DatabaseConfig {
                database_name: ":memory:".to_string(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let mut handle = mux.acquire(0).await.unwrap();
        sqlx::query(
            "CREATE TABLE customer_capabilities ( \
                customer_id INTEGER PRIMARY KEY, \
                number_monitors INTEGER NOT NULL, \
                polling_interval INTEGER NOT NULL, \
                expiration_days INTEGER NOT NULL, \
                flags INTEGER NOT NULL \
            )",
        )
        .execute(handle.connection())
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE customer_mapping ( \
                customer_id INTEGER NOT NULL, \
                server_id INTEGER NOT NULL, \
                primary_server BOOLEAN NOT NULL, \
                PRIMARY KEY (customer_id, server_id) \
            )",
        )
        .execute(handle.connection())
        .await
        .unwrap();
        handle.release().await.unwrap();

        (
            CapabilitiesStore::new(StdArc::clone(&mux), 16),
            MappingStore::new(mux),
        )
    }

    async fn start_counting_server(hits: StdArc<AtomicUsize>, paths: &[&'static str]) -> String {
        let mut router = AxumRouter::new();
        for path in paths {
            let hits_for_route = StdArc::clone(&hits);
            router = router.route(
                path,
                post(move || {
                    let hits = StdArc::clone(&hits_for_route);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        axum::http::StatusCode::OK
                    }
                }),
            );
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    fn sample(customer_id: CustomerId, rest_api: bool) -> CustomerCapabilities {
        CustomerCapabilities {
            customer_id,
            max_monitors: 10,
            polling_interval: 60,
            expiration_days: 30,
            flags: CapabilityFlags({
                let mut flags = 0u16;
                flags |= CapabilityFlags::CUSTOMER_ACTIVE;
                if rest_api {
                    flags |= CapabilityFlags::SUPPORTS_REST_API;
                }
                flags
            }),
        }
    }

    fn client() -> PollingServerClient {
        PollingServerClient::new(PollingServerConfig {
            scheme: "http".to_string(),
            port: None,
            api_key: "test-key".to_string(),
            timeout: Duration::from_millis(500),
        })
    }

    #[tokio::test]
    async fn activate_writes_the_mapping_and_notifies_the_primary() {
        let (capabilities, mapping) = fixture().await;
        capabilities.update(sample(1, true), 0).await.unwrap();

        let hits = StdArc::new(AtomicUsize::new(0));
        let host = start_counting_server(StdArc::clone(&hits), &["/customer/add"]).await;
        let registry = ServerRegistry::new(HashMap::from([(1u32, host)]));

        let administrator = ServerAdministrator::new(
            StdArc::new(mapping),
            StdArc::new(capabilities),
            client(),
            registry,
        );

        assert!(administrator.activate_customer(1, 0).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let written = administrator.mapping.mapping(1, 0).await.unwrap();
        assert_eq!(written.primary_server_id(), 1);
    }

    #[tokio::test]
    async fn activate_fails_without_a_registered_server() {
        let (capabilities, mapping) = fixture().await;
        capabilities.update(sample(2, true), 0).await.unwrap();

        let administrator = ServerAdministrator::new(
            StdArc::new(mapping),
            StdArc::new(capabilities),
            client(),
            ServerRegistry::new(HashMap::new()),
        );

        assert!(!administrator.activate_customer(2, 0).await);
    }

    #[tokio::test]
    async fn set_paused_flips_the_capability_flag_and_notifies_the_fleet() {
        let (capabilities, mapping) = fixture().await;
        capabilities.update(sample(3, true), 0).await.unwrap();

        let hits = StdArc::new(AtomicUsize::new(0));
        let host = start_counting_server(StdArc::clone(&hits), &["/customer/add", "/customer/pause"]).await;
        let registry = ServerRegistry::new(HashMap::from([(1u32, host)]));
        let capabilities = StdArc::new(capabilities);
        let mapping = StdArc::new(mapping);

        let administrator =
            ServerAdministrator::new(StdArc::clone(&mapping), StdArc::clone(&capabilities), client(), registry);
        assert!(administrator.activate_customer(3, 0).await);

        assert!(administrator.set_paused(3, true, 0).await);
        assert_eq!(hits.load(Ordering::SeqCst), 2); // the activate + the pause fan-out
        let updated = capabilities.get(3, true, 0).await.unwrap().unwrap();
        assert!(updated.flags.has(CapabilityFlags::PAUSED));
    }
}
