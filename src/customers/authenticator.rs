//! Customer authenticator (C7): maps an opaque hex identifier to an
//! internal customer id, gated on which inbound APIs a customer is
//! entitled to use, and looks up the secret used to verify requests.

use crate::customers::capabilities::CapabilitiesStore;
use crate::customers::secrets::SecretsStore;
use crate::customers::{CustomerId, INVALID_CUSTOMER_ID};
use crate::identifier::{self, IdentifierKey};
use std::sync::Arc;

/// Authenticates inbound customer REST/WordPress requests.
///
/// A customer id of `0` from either method means "reject this request" —
/// callers should turn that into an unauthorized response.
pub struct CustomerAuthenticator {
    allow_word_press: bool,
    allow_rest: bool,
    identifier_key: IdentifierKey,
    secrets: Arc<SecretsStore>,
    capabilities: Arc<CapabilitiesStore>,
}

impl CustomerAuthenticator {
    pub fn new(
        allow_word_press: bool,
        allow_rest: bool,
        identifier_key: IdentifierKey,
        secrets: Arc<SecretsStore>,
        capabilities: Arc<CapabilitiesStore>,
    ) -> Self {
        Self {
            allow_word_press,
            allow_rest,
            identifier_key,
            secrets,
            capabilities,
        }
    }

    /// Map a hex-encoded customer identifier to an internal customer id.
    ///
    /// Returns `0` if the identifier does not parse as hex, does not
    /// decrypt to a valid id, the customer has no capabilities on file, or
    /// the customer is entitled to neither of the APIs this authenticator
    /// was configured to allow.
    pub async fn customer_id(&self, customer_identifier: &str, thread_id: u32) -> CustomerId {
        let Ok(identifier_value) = u64::from_str_radix(customer_identifier, 16) else {
            return INVALID_CUSTOMER_ID;
        };

        let customer_id = identifier::to_customer_id(identifier_value, &self.identifier_key);
        if customer_id == INVALID_CUSTOMER_ID {
            return INVALID_CUSTOMER_ID;
        }

        let capabilities = match self.capabilities.get(customer_id, false, thread_id).await {
            Ok(Some(capabilities)) => capabilities,
            _ => return INVALID_CUSTOMER_ID,
        };

        let word_press_ok = self.allow_word_press && capabilities.supports_word_press();
        let rest_ok = self.allow_rest && capabilities.supports_rest_api();

        if !word_press_ok && !rest_ok {
            INVALID_CUSTOMER_ID
        } else {
            customer_id
        }
    }

    /// Look up the padded secret used to verify a customer's requests.
    /// Returns `None` if the customer has no secret on file.
    pub async fn customer_secret(&self, customer_id: CustomerId, thread_id: u32) -> Option<Vec<u8>> {
        self.secrets
            .get(customer_id, false, thread_id)
            .await
            .ok()
            .flatten()
            .map(|secret| secret.padded_secret().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cbc::EncryptionKey;
    use crate::customers::capabilities::{CapabilityFlags, CustomerCapabilities};
    use crate::database::{ConnectionMultiplexer, DatabaseConfig};

    async fn fixture(allow_word_press: bool, allow_rest: bool) -> (CustomerAuthenticator, IdentifierKey) {
        let mux = Arc::new(
            ConnectionMultiplexer::new(DatabaseConfig {
                database_name: ":memory:".to_string(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );

        {
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
            sqlx::query("CREATE TABLE customer_secrets (customer_id INTEGER PRIMARY KEY, secret BLOB NOT NULL)")
                .execute(handle.connection())
                .await
                .unwrap();
            handle.release().await.unwrap();
        }

        let capabilities = Arc::new(CapabilitiesStore::new(Arc::clone(&mux), 16));
        let secrets = Arc::new(SecretsStore::new(
            Arc::clone(&mux),
            EncryptionKey::from_bytes(&[1u8; 32]).unwrap(),
            16,
        ));

        capabilities
            .update(
                CustomerCapabilities {
                    customer_id: 7,
                    max_monitors: 5,
                    polling_interval: 60,
                    expiration_days: 30,
                    flags: CapabilityFlags(
                        CapabilityFlags::CUSTOMER_ACTIVE | CapabilityFlags::SUPPORTS_REST_API,
                    ),
                },
                0,
            )
            .await
            .unwrap();
        secrets.rotate(7, 0).await.unwrap();

        let identifier_key = IdentifierKey::from_bytes(*b"0123456789ABCDEF");
        let authenticator =
            CustomerAuthenticator::new(allow_word_press, allow_rest, identifier_key.clone(), secrets, capabilities);

        (authenticator, identifier_key)
    }

    #[tokio::test]
    async fn accepts_a_valid_identifier_for_an_entitled_customer() {
        let (auth, key) = fixture(false, true).await;
        let identifier = identifier::to_identifier(7, &key);
        let resolved = auth.customer_id(&format!("{identifier:x}"), 0).await;
        assert_eq!(resolved, 7);
        assert!(auth.customer_secret(resolved, 0).await.is_some());
    }

    #[tokio::test]
    async fn rejects_when_the_allowed_api_does_not_match_entitlement() {
        let (auth, key) = fixture(true, false).await;
        let identifier = identifier::to_identifier(7, &key);
        let resolved = auth.customer_id(&format!("{identifier:x}"), 0).await;
        assert_eq!(resolved, INVALID_CUSTOMER_ID);
    }

    #[tokio::test]
    async fn rejects_malformed_hex() {
        let (auth, _key) = fixture(false, true).await;
        assert_eq!(auth.customer_id("not-hex", 0).await, INVALID_CUSTOMER_ID);
    }

    #[tokio::test]
    async fn rejects_unknown_customer() {
        let (auth, key) = fixture(false, true).await;
        let identifier = identifier::to_identifier(999, &key);
        assert_eq!(auth.customer_id(&format!("{identifier:x}"), 0).await, INVALID_CUSTOMER_ID);
    }
}
