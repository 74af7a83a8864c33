//! Weather Bridge - service entry point
//!
//! Bootstrap order:
//! - Logging + environment (.env) + immutable configuration
//! - Broker connection (fatal after the retry budget)
//! - Discovery configs at startup, then a 12h republish task
//! - Polling loop on the main task, forever

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weather_bridge::config::BridgeConfig;
use weather_bridge::discovery::{publish_discovery, spawn_discovery_republisher};
use weather_bridge::influx::FluxHttpSource;
use weather_bridge::metrics::WEATHER_METRICS;
use weather_bridge::mqtt;
use weather_bridge::polling::run_polling_loop;
use weather_bridge::query::MetricQueryClient;
use weather_bridge::retry::RetryPolicy;

#[tokio::main]
async fn main() -> Result<()> {
    // Ok if .env does not exist
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("weather_bridge=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Weather Sensor MQTT Publisher v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(BridgeConfig::from_env().context("Invalid configuration")?);
    info!(
        "Connecting to InfluxDB at: {} (Org: {}, Bucket: {})",
        config.influx.url, config.influx.org, config.influx.bucket
    );
    info!("Connecting to MQTT Broker: {}", config.mqtt.broker);

    let retry = RetryPolicy::default();
    let publisher = Arc::new(
        mqtt::connect(&config.mqtt, retry)
            .await
            .context("Could not connect to MQTT broker")?,
    );

    publish_discovery(publisher.as_ref(), WEATHER_METRICS, &config).await;
    spawn_discovery_republisher(publisher.clone(), WEATHER_METRICS, config.clone());

    let queries = MetricQueryClient::new(
        FluxHttpSource::new(config.influx.clone()),
        config.influx.measurement.clone(),
        retry,
    );
    run_polling_loop(queries, publisher.as_ref(), WEATHER_METRICS, &config).await;

    Ok(())
}
