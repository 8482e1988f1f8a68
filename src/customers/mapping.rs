//! Customer/server mapping store (C6): tracks which polling servers a
//! customer has been assigned to, and which one is primary.

use crate::database::{ConnectionMultiplexer, DatabaseError};
use crate::customers::{CustomerId, ServerId, INVALID_SERVER_ID};
use sqlx::Connection;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// A customer's set of assigned servers plus which one is primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    primary_server_id: ServerId,
    servers: HashSet<ServerId>,
}

impl Mapping {
    pub fn new(primary_server_id: ServerId, servers: HashSet<ServerId>) -> Self {
        Self { primary_server_id, servers }
    }

    pub fn is_valid(&self) -> bool {
        self.primary_server_id != INVALID_SERVER_ID
    }

    pub fn primary_server_id(&self) -> ServerId {
        self.primary_server_id
    }

    pub fn servers(&self) -> &HashSet<ServerId> {
        &self.servers
    }

    pub fn set_primary_server(&mut self, server_id: ServerId) {
        self.primary_server_id = server_id;
    }

    fn insert(&mut self, server_id: ServerId, is_primary: bool) {
        self.servers.insert(server_id);
        if is_primary {
            if self.primary_server_id == INVALID_SERVER_ID {
                self.primary_server_id = server_id;
            } else {
                tracing::warn!(server_id, "multiple primary servers reported for a customer");
            }
        }
    }
}

/// Errors raised by the mapping store.
#[derive(Error, Debug)]
pub enum MappingError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Mapping store, backed by `customer_mapping`.
pub struct MappingStore {
    mux: Arc<ConnectionMultiplexer>,
}

impl MappingStore {
    pub fn new(mux: Arc<ConnectionMultiplexer>) -> Self {
        Self { mux }
    }

    /// Replace a customer's entire mapping with `mapping` inside a single
    /// transaction: `DELETE` the old rows, `INSERT` the new ones, and roll
    /// back on any failure so a customer never ends up with a partial
    /// mapping.
    ///
    /// The primary flag written for each row is whatever the caller
    /// declared via [`Mapping::primary_server_id`] for the incoming set,
    /// even if that server id isn't already a member — it is inserted as
    /// part of the same replacement.
    pub async fn update_mapping(
        &self,
        customer_id: CustomerId,
        mapping: &Mapping,
        thread_id: u32,
    ) -> Result<(), MappingError> {
        let mut handle = self.mux.acquire(thread_id).await?;
        let conn = handle.connection();

        let mut tx = conn.begin().await.map_err(DatabaseError::from)?;

        sqlx::query("DELETE FROM customer_mapping WHERE customer_id = ?")
            .bind(customer_id as i64)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;

        let mut servers: Vec<ServerId> = mapping.servers.iter().copied().collect();
        if mapping.primary_server_id != INVALID_SERVER_ID && !servers.contains(&mapping.primary_server_id) {
            servers.push(mapping.primary_server_id);
        }

        for server_id in servers {
            let is_primary = server_id == mapping.primary_server_id;
            let result = sqlx::query(
                "INSERT INTO customer_mapping (customer_id, server_id, primary_server) VALUES (?, ?, ?)",
            )
            .bind(customer_id as i64)
            .bind(server_id as i64)
            .bind(is_primary)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                tx.rollback().await.map_err(DatabaseError::from)?;
                handle.release().await?;
                return Err(DatabaseError::from(e).into());
            }
        }

        tx.commit().await.map_err(DatabaseError::from)?;
        handle.release().await?;
        Ok(())
    }

    /// Fetch a single customer's mapping. If more than one row is flagged
    /// primary, the first one encountered wins and a warning is logged.
    pub async fn mapping(&self, customer_id: CustomerId, thread_id: u32) -> Result<Mapping, MappingError> {
        let mut handle = self.mux.acquire(thread_id).await?;
        let rows = sqlx::query_as::<_, (i64, bool)>(
            "SELECT server_id, primary_server FROM customer_mapping WHERE customer_id = ?",
        )
        .bind(customer_id as i64)
        .fetch_all(handle.connection())
        .await
        .map_err(DatabaseError::from)?;
        handle.release().await?;

        let mut result = Mapping::default();
        for (server_id, is_primary) in rows {
            result.insert(server_id as u32, is_primary);
        }
        Ok(result)
    }

    /// Fetch mappings for every customer, optionally restricted to a
    /// single server. Rows with an invalid customer or server id are
    /// dropped and logged, matching the defensive behavior of the rest of
    /// this store.
    pub async fn mappings(
        &self,
        server_id: Option<ServerId>,
        thread_id: u32,
    ) -> Result<HashMap<CustomerId, Mapping>, MappingError> {
        let mut handle = self.mux.acquire(thread_id).await?;

        let rows = if let Some(server_id) = server_id {
            sqlx::query_as::<_, (i64, i64, bool)>(
                "SELECT customer_id, server_id, primary_server FROM customer_mapping WHERE server_id = ?",
            )
            .bind(server_id as i64)
            .fetch_all(handle.connection())
            .await
        } else {
            sqlx::query_as::<_, (i64, i64, bool)>(
                "SELECT customer_id, server_id, primary_server FROM customer_mapping",
            )
            .fetch_all(handle.connection())
            .await
        }
        .map_err(DatabaseError::from)?;
        handle.release().await?;

        let mut result: HashMap<CustomerId, Mapping> = HashMap::new();
        for (customer_id, server_id, is_primary) in rows {
            if customer_id <= 0 || server_id <= 0 {
                tracing::warn!(customer_id, server_id, "dropping invalid mapping row");
                continue;
            }
            result
                .entry(customer_id as u32)
                .or_default()
                .insert(server_id as u32, is_primary);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;

    async fn fresh_store() -> MappingStore {
        let mux = Arc::new(
            ConnectionMultiplexer::new(DatabaseConfig {
                database_name: ":memory:".to_string(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let mut handle = mux.acquire(0).await.unwrap();
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
        MappingStore::new(mux)
    }

    #[tokio::test]
    async fn update_then_read_back_round_trips() {
        let store = fresh_store().await;
        let mapping = Mapping::new(1, HashSet::from([1, 2, 3]));
        store.update_mapping(42, &mapping, 0).await.unwrap();

        let fetched = store.mapping(42, 0).await.unwrap();
        assert_eq!(fetched, mapping);
    }

    #[tokio::test]
    async fn update_mapping_replaces_rather_than_merges() {
        let store = fresh_store().await;
        store
            .update_mapping(42, &Mapping::new(1, HashSet::from([1, 2])), 0)
            .await
            .unwrap();
        store
            .update_mapping(42, &Mapping::new(5, HashSet::from([5])), 0)
            .await
            .unwrap();

        let fetched = store.mapping(42, 0).await.unwrap();
        assert_eq!(fetched, Mapping::new(5, HashSet::from([5])));
    }

    #[tokio::test]
    async fn mappings_filters_by_server_id() {
        let store = fresh_store().await;
        store
            .update_mapping(1, &Mapping::new(10, HashSet::from([10])), 0)
            .await
            .unwrap();
        store
            .update_mapping(2, &Mapping::new(20, HashSet::from([20])), 0)
            .await
            .unwrap();

        let all = store.mappings(None, 0).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_ten = store.mappings(Some(10), 0).await.unwrap();
        assert_eq!(only_ten.len(), 1);
        assert!(only_ten.contains_key(&1));
    }
}
