//! Customer REST secrets store (C4): the shared-secret values used to
//! authenticate inbound customer REST calls, encrypted at rest with
//! AES-256-CBC and cached via the C1 hash cache.

use crate::cache::{Cache, CacheEntry};
use crate::crypto::cbc::{CbcError, EncryptedSecret, EncryptionKey};
use crate::database::{ConnectionMultiplexer, DatabaseError};
use crate::customers::CustomerId;
use parking_lot::Mutex;
use rand::RngCore;
use sqlx::Row;
use std::sync::Arc;
use thiserror::Error;

/// Unpadded secret length, in bytes.
pub const SECRET_LENGTH: usize = 56;

/// Padded secret length stored/encrypted, in bytes.
pub const PADDED_SECRET_LENGTH: usize = 64;

/// A customer's current REST API secret.
#[derive(Clone, PartialEq, Eq)]
pub struct CustomerSecret {
    customer_id: CustomerId,
    padded: [u8; PADDED_SECRET_LENGTH],
}

impl CustomerSecret {
    fn new(customer_id: CustomerId, padded: [u8; PADDED_SECRET_LENGTH]) -> Self {
        Self { customer_id, padded }
    }

    pub fn is_valid(&self) -> bool {
        self.customer_id != crate::customers::INVALID_CUSTOMER_ID
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    /// The unpadded secret value, as handed to customers.
    pub fn secret(&self) -> &[u8] {
        &self.padded[..SECRET_LENGTH]
    }

    /// The full padded secret, as stored/encrypted.
    pub fn padded_secret(&self) -> &[u8; PADDED_SECRET_LENGTH] {
        &self.padded
    }

    fn generate(customer_id: CustomerId) -> Self {
        let mut padded = [0u8; PADDED_SECRET_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut padded);
        Self::new(customer_id, padded)
    }
}

impl CacheEntry for CustomerSecret {
    type Id = CustomerId;
    fn cache_id(&self) -> CustomerId {
        self.customer_id
    }
}

/// Errors raised by the secrets store.
#[derive(Error, Debug)]
pub enum SecretsError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Cbc(#[from] CbcError),

    #[error("stored secret has the wrong length after decryption")]
    CorruptSecret,
}

/// Customer secrets store, backed by `customer_secrets` and the C1 cache.
pub struct SecretsStore {
    mux: Arc<ConnectionMultiplexer>,
    cache: Mutex<Cache<CustomerSecret>>,
    encryption_key: EncryptionKey,
}

impl SecretsStore {
    pub fn new(mux: Arc<ConnectionMultiplexer>, encryption_key: EncryptionKey, cache_depth: usize) -> Self {
        Self {
            mux,
            cache: Mutex::new(Cache::new(cache_depth)),
            encryption_key,
        }
    }

    /// Fetch a customer's current secret, consulting the cache first.
    /// Returns `None` if the customer has no secret on file.
    pub async fn get(
        &self,
        customer_id: CustomerId,
        no_cache_update: bool,
        thread_id: u32,
    ) -> Result<Option<CustomerSecret>, SecretsError> {
        if let Some(hit) = self.cache.lock().get(customer_id).cloned() {
            return Ok(Some(hit));
        }

        let mut handle = self.mux.acquire(thread_id).await?;
        let row = sqlx::query("SELECT secret FROM customer_secrets WHERE customer_id = ?")
            .bind(customer_id as i64)
            .fetch_optional(handle.connection())
            .await
            .map_err(DatabaseError::from)?;
        handle.release().await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let blob: Vec<u8> = row.try_get("secret").map_err(DatabaseError::from)?;
        let plaintext = EncryptedSecret::from_stored_blob(blob).open(&self.encryption_key)?;
        let padded: [u8; PADDED_SECRET_LENGTH] = plaintext
            .try_into()
            .map_err(|_| SecretsError::CorruptSecret)?;

        let secret = CustomerSecret::new(customer_id, padded);
        if !no_cache_update {
            self.cache.lock().add_or_update(secret.clone());
        }
        Ok(Some(secret))
    }

    /// Delete a customer's secret and evict it from the cache.
    pub async fn delete(&self, customer_id: CustomerId, thread_id: u32) -> Result<(), SecretsError> {
        let mut handle = self.mux.acquire(thread_id).await?;
        sqlx::query("DELETE FROM customer_secrets WHERE customer_id = ?")
            .bind(customer_id as i64)
            .execute(handle.connection())
            .await
            .map_err(DatabaseError::from)?;
        handle.release().await?;

        self.cache.lock().evict(customer_id);
        Ok(())
    }

    /// Generate and persist a fresh secret for a customer, replacing any
    /// existing one. Reads the prior cache/database state first only to
    /// decide between `UPDATE` and `INSERT`; the returned secret is always
    /// newly generated.
    pub async fn rotate(&self, customer_id: CustomerId, thread_id: u32) -> Result<CustomerSecret, SecretsError> {
        let existing = self.get(customer_id, true, thread_id).await?;
        let secret = CustomerSecret::generate(customer_id);
        let sealed = EncryptedSecret::seal(&self.encryption_key, secret.padded_secret());

        let mut handle = self.mux.acquire(thread_id).await?;
        if existing.is_some() {
            sqlx::query("UPDATE customer_secrets SET secret = ? WHERE customer_id = ?")
                .bind(sealed.as_blob())
                .bind(customer_id as i64)
                .execute(handle.connection())
                .await
                .map_err(DatabaseError::from)?;
        } else {
            sqlx::query("INSERT INTO customer_secrets (customer_id, secret) VALUES (?, ?)")
                .bind(customer_id as i64)
                .bind(sealed.as_blob())
                .execute(handle.connection())
                .await
                .map_err(DatabaseError::from)?;
        }
        handle.release().await?;

        self.cache.lock().add_or_update(secret.clone());
        Ok(secret)
    }
}
