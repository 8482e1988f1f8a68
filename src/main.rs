//! Process entry point: load configuration, open the database, wire up
//! C1–C9, and serve the inbound REST surface (C10).

use sentrydbc::api::state::AppState;
use sentrydbc::api::routes::build_router;
use sentrydbc::config::{Config, ConfigWatcher};
use sentrydbc::crypto::cbc::EncryptionKey;
use sentrydbc::customers::{CapabilitiesStore, CustomerAuthenticator, MappingStore, SecretsStore};
use sentrydbc::database::{ConnectionMultiplexer, DatabaseConfig};
use sentrydbc::fleet::administrator::{ServerAdministrator, ServerRegistry};
use sentrydbc::fleet::client::{PollingServerClient, PollingServerConfig};
use sentrydbc::identifier::IdentifierKey;
use sentrydbc::telemetry::{AggregatorConfig, LatencyAggregator};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS customer_capabilities ( \
        customer_id INTEGER PRIMARY KEY, \
        number_monitors INTEGER NOT NULL, \
        polling_interval INTEGER NOT NULL, \
        expiration_days INTEGER NOT NULL, \
        flags INTEGER NOT NULL \
    )",
    "CREATE TABLE IF NOT EXISTS customer_secrets ( \
        customer_id INTEGER PRIMARY KEY, \
        secret BLOB NOT NULL \
    )",
    "CREATE TABLE IF NOT EXISTS customer_mapping ( \
        customer_id INTEGER NOT NULL, \
        server_id INTEGER NOT NULL, \
        primary_server BOOLEAN NOT NULL, \
        PRIMARY KEY (customer_id, server_id) \
    )",
    "CREATE TABLE IF NOT EXISTS latency_raw ( \
        rowid INTEGER PRIMARY KEY AUTOINCREMENT, \
        monitor_id INTEGER NOT NULL, \
        server_id INTEGER NOT NULL, \
        timestamp INTEGER NOT NULL, \
        count INTEGER NOT NULL, \
        mean REAL NOT NULL, \
        variance_sum REAL NOT NULL, \
        min_latency INTEGER NOT NULL, \
        max_latency INTEGER NOT NULL \
    )",
    "CREATE TABLE IF NOT EXISTS latency_aggregates ( \
        monitor_id INTEGER NOT NULL, \
        server_id INTEGER NOT NULL, \
        bucket_start INTEGER NOT NULL, \
        count INTEGER NOT NULL, \
        mean REAL NOT NULL, \
        variance_sum REAL NOT NULL, \
        min_latency INTEGER NOT NULL, \
        max_latency INTEGER NOT NULL, \
        PRIMARY KEY (monitor_id, server_id, bucket_start) \
    )",
];

async fn migrate(mux: &ConnectionMultiplexer) -> anyhow::Result<()> {
    let mut handle = mux.acquire(0).await?;
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(handle.connection()).await?;
    }
    handle.release().await?;
    Ok(())
}

/// Placement of the fleet's polling servers: `host:port` addresses keyed by
/// server id, read from the `SENTRYDBC_SERVERS` environment variable as
/// `id=host,id=host,...`. There is no dedicated server-directory store in
/// this implementation's scope (see `DESIGN.md`).
fn server_hosts_from_env() -> HashMap<u32, String> {
    std::env::var("SENTRYDBC_SERVERS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|entry| {
            let (id, host) = entry.split_once('=')?;
            Some((id.trim().parse().ok()?, host.trim().to_string()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sentrydbc.json"));

    let watcher = ConfigWatcher::start(config_path.clone())?;
    let config: Arc<Config> = watcher.current();
    tracing::info!(path = %config_path.display(), "configuration loaded");

    let mux = Arc::new(
        ConnectionMultiplexer::new(DatabaseConfig {
            database_name: config.database_name.clone(),
            busy_timeout: Duration::from_millis(5000),
            create_if_missing: true,
        })
        .await?,
    );
    migrate(&mux).await?;

    let identifier_key = IdentifierKey::from_bytes(
        config
            .decoded_identifier_key()
            .try_into()
            .map_err(|_| anyhow::anyhow!("customer_identifier_key must decode to 16 bytes"))?,
    );
    let encryption_key = EncryptionKey::from_bytes(&config.decoded_secrets_encryption_key())?;

    let capabilities = Arc::new(CapabilitiesStore::new(
        Arc::clone(&mux),
        config.customer_capabilities_cache_size,
    ));
    let secrets = Arc::new(SecretsStore::new(
        Arc::clone(&mux),
        encryption_key,
        config.customer_secrets_cache_size,
    ));
    let mapping = Arc::new(MappingStore::new(Arc::clone(&mux)));

    let registry = ServerRegistry::new(server_hosts_from_env());
    let client = PollingServerClient::new(PollingServerConfig {
        scheme: match config.polling_server_scheme {
            sentrydbc::config::PollingServerScheme::Http => "http".to_string(),
            sentrydbc::config::PollingServerScheme::Https => "https".to_string(),
        },
        port: (config.polling_server_port != 0).then_some(config.polling_server_port),
        api_key: config.polling_server_api_key.clone(),
        timeout: Duration::from_secs(10),
    });
    let administrator = Arc::new(ServerAdministrator::new(
        Arc::clone(&mapping),
        Arc::clone(&capabilities),
        client,
        registry,
    ));

    let aggregator = Arc::new(LatencyAggregator::new(
        Arc::clone(&mux),
        AggregatorConfig {
            input_table_maximum_age: config.aggregation_age,
            resample_period: config.aggregation_sample_period,
            expunge_period: config.expunge_age,
        },
    ));
    Arc::clone(&aggregator).spawn(0);

    // Restrictive, REST-only policy and the permissive WordPress + REST
    // policy each get their own instance; which one protects an endpoint is
    // decided in `api::routes`.
    let authenticator_rest = Arc::new(CustomerAuthenticator::new(
        false,
        true,
        identifier_key.clone(),
        Arc::clone(&secrets),
        Arc::clone(&capabilities),
    ));
    let authenticator_word_press = Arc::new(CustomerAuthenticator::new(
        true,
        true,
        identifier_key.clone(),
        Arc::clone(&secrets),
        Arc::clone(&capabilities),
    ));

    // One-shot reconciliation at boot: push every known customer's current
    // mapping state to its servers in case the fleet changed while this
    // process was down.
    administrator.send_go_active(64, 0).await;

    let state = Arc::new(AppState::new(
        capabilities,
        secrets,
        mapping,
        administrator,
        aggregator,
        authenticator_rest,
        authenticator_word_press,
        identifier_key,
        config.decoded_inbound_api_key(),
        config.maximum_concurrent_connections.clamp(1, 256),
    ));

    let app = build_router(state);
    let address = format!("{}:{}", config.inbound_host_address, config.inbound_port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(%address, "sentrydbc listening");
    axum::serve(listener, app).await?;

    Ok(())
}
