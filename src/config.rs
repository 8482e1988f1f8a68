//! Process configuration: loaded from a JSON file, validated, and watched
//! for changes so an edit takes effect without a restart.

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised loading or validating the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The scheme polling servers are dialed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollingServerScheme {
    Http,
    Https,
}

/// Top-level process configuration, matching the JSON file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_username: String,
    pub database_password: String,
    pub database_name: String,
    pub database_server: String,

    pub inbound_host_address: String,
    pub inbound_port: u16,
    pub maximum_concurrent_connections: u32,

    /// Base64-encoded; must decode to exactly [`INBOUND_API_KEY_LENGTH`] bytes.
    pub inbound_api_key: String,

    pub website_authority: String,
    pub website_api_key: String,
    pub polling_server_api_key: String,
    pub polling_server_scheme: PollingServerScheme,
    /// `0` means use the scheme's default port.
    pub polling_server_port: u16,

    /// Base64-encoded 32-byte AES-256 key.
    pub customer_secrets_encryption_key: String,
    /// Base64-encoded 16-byte XTEA key.
    pub customer_identifier_key: String,

    pub customer_secrets_cache_size: usize,
    pub customer_capabilities_cache_size: usize,

    pub aggregation_age: u64,
    pub aggregation_sample_period: u64,
    pub expunge_age: u64,

    #[serde(default)]
    pub verbose: bool,
}

/// Required decoded length of `inbound_api_key`, in bytes.
pub const INBOUND_API_KEY_LENGTH: usize = 32;

impl Config {
    /// Load and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde's types already guarantee.
    /// Every violation is logged; the first is also returned so the
    /// caller can decide whether to exit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        match BASE64.decode(&self.inbound_api_key) {
            Ok(bytes) if bytes.len() == INBOUND_API_KEY_LENGTH => {}
            Ok(bytes) => problems.push(format!(
                "inbound_api_key decodes to {} bytes, expected {INBOUND_API_KEY_LENGTH}",
                bytes.len()
            )),
            Err(e) => problems.push(format!("inbound_api_key is not valid base64: {e}")),
        }

        match BASE64.decode(&self.customer_secrets_encryption_key) {
            Ok(bytes) if bytes.len() == 32 => {}
            Ok(bytes) => problems.push(format!(
                "customer_secrets_encryption_key decodes to {} bytes, expected 32",
                bytes.len()
            )),
            Err(e) => problems.push(format!("customer_secrets_encryption_key is not valid base64: {e}")),
        }

        match BASE64.decode(&self.customer_identifier_key) {
            Ok(bytes) if bytes.len() == 16 => {}
            Ok(bytes) => problems.push(format!(
                "customer_identifier_key decodes to {} bytes, expected 16",
                bytes.len()
            )),
            Err(e) => problems.push(format!("customer_identifier_key is not valid base64: {e}")),
        }

        if self.aggregation_sample_period == 0 {
            problems.push("aggregation_sample_period must be non-zero".to_string());
        }

        if self.maximum_concurrent_connections == 0 {
            problems.push("maximum_concurrent_connections must be non-zero".to_string());
        }

        for problem in &problems {
            tracing::error!(%problem, "invalid configuration");
        }

        match problems.into_iter().next() {
            Some(first) => Err(ConfigError::Invalid(first)),
            None => Ok(()),
        }
    }

    pub fn decoded_inbound_api_key(&self) -> Vec<u8> {
        BASE64.decode(&self.inbound_api_key).unwrap_or_default()
    }

    pub fn decoded_secrets_encryption_key(&self) -> Vec<u8> {
        BASE64.decode(&self.customer_secrets_encryption_key).unwrap_or_default()
    }

    pub fn decoded_identifier_key(&self) -> Vec<u8> {
        BASE64.decode(&self.customer_identifier_key).unwrap_or_default()
    }
}

/// Holds the active configuration behind a lock-free swap so request
/// handlers can read it without blocking a concurrent reload, and watches
/// the backing file for edits.
pub struct ConfigWatcher {
    current: Arc<ArcSwap<Config>>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Load `path` once, then start watching it for changes. A change that
    /// fails to parse or validate is logged and ignored; the previously
    /// loaded configuration stays active.
    pub fn start(path: PathBuf) -> Result<Self, ConfigError> {
        let initial = Config::load(&path)?;
        let current = Arc::new(ArcSwap::from_pointee(initial));

        let (tx, rx) = channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(tx).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let reload_current = Arc::clone(&current);
        let reload_path = path.clone();
        std::thread::spawn(move || {
            while let Ok(event) = rx.recv_timeout(Duration::from_secs(3600 * 24 * 365)) {
                let Ok(event) = event else { continue };
                if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                    continue;
                }

                match Config::load(&reload_path) {
                    Ok(config) => {
                        tracing::info!(path = %reload_path.display(), "configuration reloaded");
                        reload_current.store(Arc::new(config));
                    }
                    Err(error) => {
                        tracing::error!(%error, "configuration reload failed, keeping previous configuration");
                    }
                }
            }
        });

        Ok(Self {
            current,
            _watcher: watcher,
        })
    }

    /// The currently active configuration snapshot.
    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_json() -> String {
        serde_json::json!({
            "database_username": "u",
            "database_password": "p",
            "database_name": "sentrydbc",
            "database_server": "localhost",
            "inbound_host_address": "0.0.0.0",
            "inbound_port": 8080,
            "maximum_concurrent_connections": 64,
            "inbound_api_key": BASE64.encode([1u8; 32]),
            "website_authority": "example.com",
            "website_api_key": "wak",
            "polling_server_api_key": "psak",
            "polling_server_scheme": "https",
            "polling_server_port": 0,
            "customer_secrets_encryption_key": BASE64.encode([2u8; 32]),
            "customer_identifier_key": BASE64.encode([3u8; 16]),
            "customer_secrets_cache_size": 10000,
            "customer_capabilities_cache_size": 10000,
            "aggregation_age": 300,
            "aggregation_sample_period": 60,
            "expunge_age": 604800,
            "verbose": false
        })
        .to_string()
    }

    #[test]
    fn loads_and_validates_a_well_formed_file() {
        let file = tempfile_for_test(&sample_json());
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.inbound_port, 8080);
    }

    #[test]
    fn rejects_a_mis_sized_key() {
        let mut json: serde_json::Value = serde_json::from_str(&sample_json()).unwrap();
        json["inbound_api_key"] = serde_json::Value::String(BASE64.encode([1u8; 4]));
        let file = tempfile_for_test(&json.to_string());
        assert!(Config::load(file.path()).is_err());
    }

    fn tempfile_for_test(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }
}
