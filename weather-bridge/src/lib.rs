//! Weather Bridge - InfluxDB weather aggregates republished as Home Assistant MQTT sensors
//!
//! The bridge:
//! - Queries daily aggregates (sum/min/max since local midnight) from InfluxDB
//! - Publishes Home Assistant discovery configs (startup + every 12h)
//! - Publishes current readings and an availability heartbeat every 2 minutes
//! - Retries both network dependencies with a fixed, bounded policy

pub mod config;
pub mod discovery;
pub mod influx;
pub mod metrics;
pub mod mqtt;
pub mod polling;
pub mod query;
pub mod retry;

pub use config::{BridgeConfig, ConfigError, QueryFailurePolicy};
pub use discovery::{publish_discovery, DiscoveryConfig, DiscoveryReport};
pub use influx::{FluxHttpSource, MetricQuery, MetricSource, QueryError};
pub use metrics::{Aggregation, MetricDefinition, WEATHER_METRICS};
pub use mqtt::{MqttPublisher, PublishError, StatePublisher};
pub use polling::{run_poll_cycle, CycleReport, SensorReading};
pub use query::MetricQueryClient;
pub use retry::{RetryError, RetryPolicy};
