mod cache;
mod codec;
mod config;
mod errors;
mod metrics;
mod model;
mod mqtt;
mod registry;
mod router;
mod store;
mod writer;

use anyhow::Context;
use axum::{routing::get, Router as HttpRouter};
use cache::{LastValueCache, MemoryCache, PgCache};
use config::{CacheBackend, IngestorConfig};
use registry::Allowlist;
use router::Router;
use std::sync::Arc;
use std::time::Duration;
use store::{PgStore, TimeSeriesStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestorConfig::from_env().context("Invalid configuration")?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Starting uplink ingestor");
    info!("MQTT broker: {}:{} topic {}", config.mqtt_broker, config.mqtt_port, config.mqtt_topic);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));
    info!(
        "Reading bounds: [{}, {}], heartbeat policy: {:?}, cache: {:?}",
        config.reading_bounds.min,
        config.reading_bounds.max,
        config.heartbeat_policy,
        config.cache_backend
    );

    // Initialize metrics
    metrics::init_metrics();

    let pool = store::make_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store: Arc<dyn TimeSeriesStore> = Arc::new(PgStore::new(pool.clone()));
    let cache: Arc<dyn LastValueCache> = match config.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::Postgres => Arc::new(PgCache::new(pool)),
    };

    let allowlist = Allowlist::new(config.device_allowlist.iter().cloned());
    if allowlist.is_empty() {
        warn!("DEVICE_ALLOWLIST is empty; every uplink will be dropped");
    } else {
        info!("Accepting uplinks from {} devices", allowlist.len());
    }

    info!("Write queue capacity: {}", config.channel_capacity);
    let (sink, rx) = writer::channel(config.channel_capacity);

    let writer_store = store.clone();
    let (batch_size, batch_timeout_ms, write_timeout) =
        (config.batch_size, config.batch_timeout_ms, config.op_timeout);
    let mut writer_handle = tokio::spawn(async move {
        writer::run_writer(rx, writer_store, batch_size, batch_timeout_ms, write_timeout).await;
    });

    let router = Arc::new(Router::new(
        Arc::new(allowlist),
        cache,
        store,
        sink,
        config.heartbeat_policy,
        config.op_timeout,
    ));

    let settings = mqtt::MqttSettings {
        broker: config.mqtt_broker.clone(),
        port: config.mqtt_port,
        client_id: format!("ingestor-{}", uuid::Uuid::new_v4()),
        username: config.mqtt_username.clone(),
        password: config.mqtt_password.clone(),
        topic: config.mqtt_topic.clone(),
    };
    let bounds = config.reading_bounds;
    let mut mqtt_handle = tokio::spawn(mqtt::run_mqtt(settings, router, bounds));

    let app = HttpRouter::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    let mut mqtt_running = true;
    let mut writer_running = true;

    tokio::select! {
        result = &mut mqtt_handle => {
            mqtt_running = false;
            match result {
                Ok(Err(e)) => {
                    error!("MQTT task failed: {}", e);
                    return Err(e).context("Uplink source unavailable");
                }
                _ => error!("MQTT task terminated"),
            }
        }
        _ = &mut writer_handle => {
            writer_running = false;
            error!("Writer task terminated");
        }
        _ = &mut server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Stopping the MQTT task drops the last queue sender so the writer drains
    if mqtt_running {
        mqtt_handle.abort();
        let _ = mqtt_handle.await;
    }
    if writer_running
        && tokio::time::timeout(Duration::from_secs(5), writer_handle)
            .await
            .is_err()
    {
        warn!("Writer did not drain within 5s");
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
