//! Configuration management for the weather bridge
//!
//! Handles:
//! - InfluxDB connection settings (URL, token, org, bucket, measurement)
//! - MQTT broker settings (address, credentials, logical sensor id)
//! - Home Assistant device metadata
//! - Fixed scheduling and retry constants
//!
//! Everything is read once at startup into an immutable [`BridgeConfig`]
//! which is then passed explicitly to each component.

use std::time::Duration;
use thiserror::Error;

/// Interval between two polling cycles (query every metric + publish states)
pub const POLL_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Interval between two discovery config republishes
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Attempts made for a query or a broker connection before giving up
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay between two attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// MQTT keep-alive
pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Maximum wait for a broker PUBACK
pub const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid broker address '{0}'")]
    InvalidBroker(String),
    #[error("invalid query failure policy '{0}' (expected 'zero' or 'skip')")]
    InvalidFailurePolicy(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub influx: InfluxConfig,
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    pub on_query_failure: QueryFailurePolicy,
}

#[derive(Clone, PartialEq)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
}

#[derive(Clone, PartialEq)]
pub struct MqttConfig {
    pub broker: BrokerAddress,
    pub username: String,
    pub password: String,
    /// Logical sensor id, substituted into every topic template
    pub sensor_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub suggested_area: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

/// What a polling cycle does with a metric whose query exhausted its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFailurePolicy {
    /// Publish `0.00` for the metric
    PublishZero,
    /// Leave the metric out of this cycle
    Skip,
}

impl BrokerAddress {
    /// Accepts `tcp://host:port`, `mqtt://host:port` or `host:port`.
    /// The port defaults to 1883.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let without_scheme = ["tcp://", "mqtt://"]
            .iter()
            .find_map(|scheme| trimmed.strip_prefix(scheme))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let (host, port) = match without_scheme.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidBroker(raw.to_string()))?;
                (host, port)
            }
            None => (without_scheme, DEFAULT_MQTT_PORT),
        };

        if host.is_empty() || host.contains("://") {
            return Err(ConfigError::InvalidBroker(raw.to_string()));
        }

        Ok(Self { host: host.to_string(), port })
    }
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl QueryFailurePolicy {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(Self::PublishZero),
            "skip" => Ok(Self::Skip),
            _ => Err(ConfigError::InvalidFailurePolicy(raw.to_string())),
        }
    }
}

// Secrets stay out of the logs
impl std::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("token", &redact(&self.token))
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("measurement", &self.measurement)
            .finish()
    }
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker", &self.broker)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("sensor_id", &self.sensor_id)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

impl BridgeConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup, falling back
    /// to defaults for every missing key
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let broker = BrokerAddress::parse(&get("MQTT_BROKER", "tcp://homeassistant.local:1883"))?;
        let on_query_failure = QueryFailurePolicy::parse(&get("QUERY_FAILURE_POLICY", "zero"))?;

        Ok(Self {
            influx: InfluxConfig {
                url: get("INFLUX_URL", "http://localhost:8086"),
                token: get("INFLUX_TOKEN", ""),
                org: get("INFLUX_ORG", "your-org"),
                bucket: get("INFLUX_BUCKET", "your-bucket"),
                measurement: get("INFLUX_MEASUREMENT", "sensor-data"),
            },
            mqtt: MqttConfig {
                broker,
                username: get("MQTT_USERNAME", ""),
                password: get("MQTT_PASSWORD", ""),
                sensor_id: get("MQTT_SENSOR", "influx-import"),
            },
            device: DeviceConfig {
                name: get("DEVICE_NAME", "Influx Import"),
                suggested_area: get("DEVICE_AREA", "Garage"),
            },
            on_query_failure,
        })
    }
}
