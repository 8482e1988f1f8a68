//! Outbound HTTP client to polling servers: HMAC-signed POSTs, a single
//! retry on failure, and a per-server degraded-node registry.

use dashmap::DashSet;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised delivering a request to a polling server.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("request to {host} failed after retry: {source}")]
    Unreachable { host: String, source: reqwest::Error },

    #[error("{host} responded with status {status}")]
    NonSuccess { host: String, status: u16 },
}

/// How polling-server URLs are built: `{scheme}://{host}[:{port}]{path}`.
#[derive(Debug, Clone)]
pub struct PollingServerConfig {
    pub scheme: String,
    /// `None` means use the scheme default (80/443).
    pub port: Option<u16>,
    pub api_key: String,
    pub timeout: Duration,
}

impl Default for PollingServerConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            port: None,
            api_key: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Outbound client used by the server administrator (C8) to push
/// customer/mapping changes to individual polling servers.
///
/// Every call retries exactly once on failure, then records the server as
/// degraded and returns an error; it never retries beyond that so a single
/// down node cannot stall an admin operation indefinitely.
pub struct PollingServerClient {
    http: reqwest::Client,
    config: PollingServerConfig,
    degraded: Arc<DashSet<String>>,
}

impl PollingServerClient {
    pub fn new(config: PollingServerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client configuration is always valid");

        Self {
            http,
            config,
            degraded: Arc::new(DashSet::new()),
        }
    }

    fn url(&self, host: &str, path: &str) -> String {
        match self.config.port {
            Some(port) => format!("{}://{}:{}{}", self.config.scheme, host, port, path),
            None => format!("{}://{}{}", self.config.scheme, host, path),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.api_key.as_bytes())
            .expect("HMAC accepts a key of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// POST a JSON body to `host` + `path`, signed with the polling-server
    /// API key. Retries once on any transport or non-2xx failure; marks
    /// `host` degraded if both attempts fail.
    pub async fn post<T: Serialize>(&self, host: &str, path: &str, body: &T) -> Result<(), FleetError> {
        let url = self.url(host, path);
        let payload = serde_json::to_string(body).unwrap_or_default();
        let signature = self.sign(&payload);

        match self.attempt(&url, &payload, &signature).await {
            Ok(()) => {
                self.degraded.remove(host);
                Ok(())
            }
            Err(_) => match self.attempt(&url, &payload, &signature).await {
                Ok(()) => {
                    self.degraded.remove(host);
                    Ok(())
                }
                Err(err) => {
                    self.degraded.insert(host.to_string());
                    tracing::warn!(host, path, "marking polling server degraded after retry");
                    Err(err)
                }
            },
        }
    }

    async fn attempt(&self, url: &str, payload: &str, signature: &str) -> Result<(), FleetError> {
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("X-Signature", signature)
            .body(payload.to_string())
            .send()
            .await
            .map_err(|source| FleetError::Unreachable {
                host: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FleetError::NonSuccess {
                host: url.to_string(),
                status: status.as_u16(),
            })
        }
    }

    /// Whether `host` is currently believed degraded (both attempts of the
    /// most recent call to it failed).
    pub fn is_degraded(&self, host: &str) -> bool {
        self.degraded.contains(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    /// Start a local HTTP server whose every request increments `hits` and
    /// answers 200 OK. Returns the `host:port` string to dial.
    async fn start_server(hits: StdArc<AtomicUsize>) -> String {
        let router = Router::new().route(
            "/customer/add",
            post(move || {
                let hits = StdArc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    /// A server that always refuses the connection, to exercise the
    /// retry-once-then-degrade path without flaking on timing.
    fn unreachable_host() -> String {
        "127.0.0.1:1".to_string()
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
    async fn a_healthy_server_is_never_marked_degraded() {
        let hits = StdArc::new(AtomicUsize::new(0));
        let host = start_server(StdArc::clone(&hits)).await;
        let client = client();

        client.post(&host, "/customer/add", &serde_json::json!({"customer_id": 1})).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!client.is_degraded(&host));
    }

    #[tokio::test]
    async fn both_attempts_failing_marks_the_host_degraded() {
        let client = client();
        let host = unreachable_host();

        let result = client.post(&host, "/customer/add", &serde_json::json!({"customer_id": 1})).await;

        assert!(result.is_err());
        assert!(client.is_degraded(&host));
    }

    #[tokio::test]
    async fn a_successful_call_clears_a_previously_degraded_host() {
        let client = client();
        let host = unreachable_host();
        let _ = client.post(&host, "/customer/add", &serde_json::json!({"customer_id": 1})).await;
        assert!(client.is_degraded(&host));

        let hits = StdArc::new(AtomicUsize::new(0));
        let real_host = start_server(hits).await;
        client.post(&real_host, "/customer/add", &serde_json::json!({"customer_id": 1})).await.unwrap();
        assert!(!client.is_degraded(&real_host));
    }
}
