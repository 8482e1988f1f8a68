//! Capabilities store (C5): per-customer feature/quota record, cached via
//! the C1 hash cache, with bulk purge support.

use crate::cache::{Cache, CacheEntry};
use crate::database::{ConnectionMultiplexer, DatabaseError};
use crate::customers::CustomerId;
use parking_lot::Mutex;
use sqlx::Row;
use std::sync::Arc;
use thiserror::Error;

/// Bit positions within the `flags` column of `customer_capabilities`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFlags(pub u16);

impl CapabilityFlags {
    pub const CUSTOMER_ACTIVE: u16 = 1 << 0;
    pub const MULTI_REGION_CHECKING: u16 = 1 << 1;
    pub const SUPPORTS_WORDPRESS: u16 = 1 << 2;
    pub const SUPPORTS_REST_API: u16 = 1 << 3;
    pub const SUPPORTS_CONTENT_CHECKING: u16 = 1 << 4;
    pub const SUPPORTS_KEYWORD_CHECKING: u16 = 1 << 5;
    pub const SUPPORTS_POST_METHOD: u16 = 1 << 6;
    pub const SUPPORTS_LATENCY_TRACKING: u16 = 1 << 7;
    pub const SUPPORTS_SSL_EXPIRATION_CHECKING: u16 = 1 << 8;
    pub const SUPPORTS_PING_BASED_POLLING: u16 = 1 << 9;
    pub const SUPPORTS_BLACKLIST_CHECKING: u16 = 1 << 10;
    pub const SUPPORTS_DOMAIN_EXPIRATION_CHECKING: u16 = 1 << 11;
    pub const SUPPORTS_MAINTENANCE_MODE: u16 = 1 << 12;
    pub const SUPPORTS_ROLLUPS: u16 = 1 << 13;
    pub const PAUSED: u16 = 1 << 14;

    pub fn has(&self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u16, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// A customer's feature and quota record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerCapabilities {
    pub customer_id: CustomerId,
    pub max_monitors: u16,
    pub polling_interval: u16,
    pub expiration_days: u32,
    pub flags: CapabilityFlags,
}

impl CustomerCapabilities {
    pub fn is_valid(&self) -> bool {
        self.customer_id != crate::customers::INVALID_CUSTOMER_ID
    }

    pub fn supports_word_press(&self) -> bool {
        self.flags.has(CapabilityFlags::SUPPORTS_WORDPRESS)
    }

    pub fn supports_rest_api(&self) -> bool {
        self.flags.has(CapabilityFlags::SUPPORTS_REST_API)
    }

    pub fn customer_active(&self) -> bool {
        self.flags.has(CapabilityFlags::CUSTOMER_ACTIVE)
    }
}

impl CacheEntry for CustomerCapabilities {
    type Id = CustomerId;
    fn cache_id(&self) -> CustomerId {
        self.customer_id
    }
}

/// Errors raised by the capabilities store.
#[derive(Error, Debug)]
pub enum CapabilitiesError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Row-level validation bounds named in `SPEC_FULL.md` §4.5. The fields are
/// already `u16`/`u32` in Rust so these exist only where the raw database
/// column is wider (`INTEGER` in SQLite is a signed 64-bit value) and must
/// be range-checked before narrowing.
fn validate_row(
    customer_id: i64,
    number_monitors: i64,
    polling_interval: i64,
    expiration_days: i64,
    flags: i64,
) -> Option<CustomerCapabilities> {
    if customer_id <= 0
        || number_monitors < 0
        || number_monitors > 0xFFFF
        || polling_interval < 0
        || polling_interval > 0xFFFF
        || flags < 0
        || flags > 0xFFFF
        || expiration_days < 0
        || expiration_days > u32::MAX as i64
    {
        return None;
    }

    Some(CustomerCapabilities {
        customer_id: customer_id as u32,
        max_monitors: number_monitors as u16,
        polling_interval: polling_interval as u16,
        expiration_days: expiration_days as u32,
        flags: CapabilityFlags(flags as u16),
    })
}

/// Capabilities store, backed by `customer_capabilities` and a shared
/// single-mutex cache per `SPEC_FULL.md` §5.
pub struct CapabilitiesStore {
    mux: Arc<ConnectionMultiplexer>,
    cache: Mutex<Cache<CustomerCapabilities>>,
}

impl CapabilitiesStore {
    pub fn new(mux: Arc<ConnectionMultiplexer>, cache_depth: usize) -> Self {
        Self {
            mux,
            cache: Mutex::new(Cache::new(cache_depth)),
        }
    }

    /// Fetch a capabilities record, consulting the cache first.
    pub async fn get(
        &self,
        customer_id: CustomerId,
        no_cache_update: bool,
        thread_id: u32,
    ) -> Result<Option<CustomerCapabilities>, CapabilitiesError> {
        if let Some(hit) = self.cache.lock().get(customer_id).cloned() {
            return Ok(Some(hit));
        }

        let mut handle = self.mux.acquire(thread_id).await?;
        let row = sqlx::query(
            "SELECT customer_id, number_monitors, polling_interval, expiration_days, flags \
             FROM customer_capabilities WHERE customer_id = ?",
        )
        .bind(customer_id as i64)
        .fetch_optional(handle.connection())
        .await
        .map_err(DatabaseError::from)?;
        handle.release().await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let caps = validate_row(
            row.try_get::<i64, _>("customer_id").unwrap_or(0),
            row.try_get("number_monitors").unwrap_or(-1),
            row.try_get("polling_interval").unwrap_or(-1),
            row.try_get("expiration_days").unwrap_or(-1),
            row.try_get("flags").unwrap_or(-1),
        );

        let Some(caps) = caps else {
            tracing::warn!(customer_id, "discarding invalid capabilities row");
            return Ok(None);
        };

        if !no_cache_update {
            self.cache.lock().add_or_update(caps.clone());
        }

        Ok(Some(caps))
    }

    /// UPSERT a capabilities record: `UPDATE` if a row already exists,
    /// otherwise `INSERT`. Publishes to the cache only after the write
    /// succeeds.
    pub async fn update(
        &self,
        caps: CustomerCapabilities,
        thread_id: u32,
    ) -> Result<(), CapabilitiesError> {
        let mut handle = self.mux.acquire(thread_id).await?;

        let updated = sqlx::query(
            "UPDATE customer_capabilities \
             SET number_monitors = ?, polling_interval = ?, expiration_days = ?, flags = ? \
             WHERE customer_id = ?",
        )
        .bind(caps.max_monitors as i64)
        .bind(caps.polling_interval as i64)
        .bind(caps.expiration_days as i64)
        .bind(caps.flags.0 as i64)
        .bind(caps.customer_id as i64)
        .execute(handle.connection())
        .await
        .map_err(DatabaseError::from)?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO customer_capabilities \
                 (customer_id, number_monitors, polling_interval, expiration_days, flags) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(caps.customer_id as i64)
            .bind(caps.max_monitors as i64)
            .bind(caps.polling_interval as i64)
            .bind(caps.expiration_days as i64)
            .bind(caps.flags.0 as i64)
            .execute(handle.connection())
            .await
            .map_err(DatabaseError::from)?;
        }

        handle.release().await?;
        self.cache.lock().add_or_update(caps);
        Ok(())
    }

    /// Delete a single customer's capabilities row and evict the cache.
    pub async fn delete(
        &self,
        customer_id: CustomerId,
        thread_id: u32,
    ) -> Result<(), CapabilitiesError> {
        let mut handle = self.mux.acquire(thread_id).await?;
        sqlx::query("DELETE FROM customer_capabilities WHERE customer_id = ?")
            .bind(customer_id as i64)
            .execute(handle.connection())
            .await
            .map_err(DatabaseError::from)?;
        handle.release().await?;

        self.cache.lock().evict(customer_id);
        Ok(())
    }

    /// Bulk purge: evict every id from the cache, then issue a single
    /// `DELETE ... IN (...)` with the cache mutex held across the DELETE,
    /// so a concurrent `get()` cannot repopulate a row that is about to be
    /// deleted out from under it.
    pub async fn purge(
        &self,
        customer_ids: &[CustomerId],
        thread_id: u32,
    ) -> Result<(), CapabilitiesError> {
        if customer_ids.is_empty() {
            return Ok(());
        }

        let mut cache = self.cache.lock();
        for &id in customer_ids {
            cache.evict(id);
        }

        let placeholders = std::iter::repeat("?")
            .take(customer_ids.len())
            .collect::<Vec<_>>()
            .join(", ");
        let query_text =
            format!("DELETE FROM customer_capabilities WHERE customer_id IN ({placeholders})");

        let mut handle = self.mux.acquire(thread_id).await?;
        let mut query = sqlx::query(&query_text);
        for &id in customer_ids {
            query = query.bind(id as i64);
        }
        query
            .execute(handle.connection())
            .await
            .map_err(DatabaseError::from)?;
        handle.release().await?;

        drop(cache);
        Ok(())
    }

    /// Every valid capabilities row. Invalid rows are logged and skipped.
    pub async fn get_all(
        &self,
        thread_id: u32,
    ) -> Result<Vec<CustomerCapabilities>, CapabilitiesError> {
        let mut handle = self.mux.acquire(thread_id).await?;
        let rows = sqlx::query(
            "SELECT customer_id, number_monitors, polling_interval, expiration_days, flags \
             FROM customer_capabilities",
        )
        .fetch_all(handle.connection())
        .await
        .map_err(DatabaseError::from)?;
        handle.release().await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let caps = validate_row(
                row.try_get("customer_id").unwrap_or(0),
                row.try_get("number_monitors").unwrap_or(-1),
                row.try_get("polling_interval").unwrap_or(-1),
                row.try_get("expiration_days").unwrap_or(-1),
                row.try_get("flags").unwrap_or(-1),
            );
            match caps {
                Some(caps) => result.push(caps),
                None => tracing::warn!("skipping invalid capabilities row during getAll"),
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;

    async fn fresh_store() -> CapabilitiesStore {
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
        handle.release().await.unwrap();
        CapabilitiesStore::new(mux, 16)
    }

    fn sample(id: CustomerId) -> CustomerCapabilities {
        CustomerCapabilities {
            customer_id: id,
            max_monitors: 10,
            polling_interval: 60,
            expiration_days: 30,
            flags: CapabilityFlags(CapabilityFlags::SUPPORTS_REST_API | CapabilityFlags::CUSTOMER_ACTIVE),
        }
    }

    #[tokio::test]
    async fn update_then_get_round_trips() {
        let store = fresh_store().await;
        store.update(sample(42), 0).await.unwrap();
        let got = store.get(42, false, 0).await.unwrap().unwrap();
        assert_eq!(got, sample(42));
        assert!(got.supports_rest_api());
    }

    #[tokio::test]
    async fn delete_then_get_is_absent() {
        let store = fresh_store().await;
        store.update(sample(42), 0).await.unwrap();
        store.delete(42, 0).await.unwrap();
        assert!(store.get(42, false, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_removes_all_listed_customers() {
        let store = fresh_store().await;
        store.update(sample(1), 0).await.unwrap();
        store.update(sample(2), 0).await.unwrap();
        store.purge(&[1, 2], 0).await.unwrap();
        assert!(store.get(1, false, 0).await.unwrap().is_none());
        assert!(store.get(2, false, 0).await.unwrap().is_none());
    }
}
