//! Static catalogue of the weather metrics republished to Home Assistant
//!
//! Each [`MetricDefinition`] ties an InfluxDB (field, aggregation) pair to the
//! MQTT topics and the Home Assistant presentation of one sensor entity.
//! Topic templates carry a single `%s` placeholder for the sensor id.

use std::fmt;

/// Availability topic shared by every sensor of the bridge
pub const AVAILABILITY_TOPIC: &str = "homeassistant/sensor/%s/availability";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

/// Flux aggregation applied over [local midnight, now)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Sum,
    Min,
    Max,
}

impl Aggregation {
    /// Name of the Flux function
    pub fn flux_fn(self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flux_fn())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    /// Topic segment identifying the metric (`rain`, `wind-max`, ...)
    pub key: &'static str,
    pub field: &'static str,
    pub aggregation: Aggregation,
    pub state_topic: &'static str,
    pub config_topic: &'static str,
    pub device_class: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub state_class: Option<&'static str>,
}

impl MetricDefinition {
    pub fn state_topic_for(&self, sensor_id: &str) -> String {
        render_topic(self.state_topic, sensor_id)
    }

    pub fn config_topic_for(&self, sensor_id: &str) -> String {
        render_topic(self.config_topic, sensor_id)
    }

    /// `<sensor-id>-sensor-<metric-key>`
    pub fn unique_id_for(&self, sensor_id: &str) -> String {
        format!("{}-sensor-{}", sensor_id, self.key)
    }
}

/// Every metric tracked by the bridge, in publish order
pub const WEATHER_METRICS: &[MetricDefinition] = &[
    MetricDefinition {
        key: "rain",
        field: "rain",
        aggregation: Aggregation::Sum,
        state_topic: "homeassistant/sensor/%s/rain/state",
        config_topic: "homeassistant/sensor/%s/rain/config",
        device_class: "precipitation",
        name: "Rainfall Sensor",
        unit: "mm",
        state_class: Some("total_increasing"),
    },
    MetricDefinition {
        key: "wind-max",
        field: "wind",
        aggregation: Aggregation::Max,
        state_topic: "homeassistant/sensor/%s/wind-max/state",
        config_topic: "homeassistant/sensor/%s/wind-max/config",
        device_class: "wind_speed",
        name: "Max Wind Speed",
        unit: "km/h",
        state_class: Some("measurement"),
    },
    MetricDefinition {
        key: "wind-gust-max",
        field: "wind-gust",
        aggregation: Aggregation::Max,
        state_topic: "homeassistant/sensor/%s/wind-gust-max/state",
        config_topic: "homeassistant/sensor/%s/wind-gust-max/config",
        device_class: "wind_speed",
        name: "Max Wind Gust Speed",
        unit: "km/h",
        state_class: Some("measurement"),
    },
    MetricDefinition {
        key: "temperature-min",
        field: "temperature",
        aggregation: Aggregation::Min,
        state_topic: "homeassistant/sensor/%s/temperature-min/state",
        config_topic: "homeassistant/sensor/%s/temperature-min/config",
        device_class: "temperature",
        name: "Minimum Temperature",
        unit: "℃",
        state_class: Some("measurement"),
    },
    MetricDefinition {
        key: "temperature-max",
        field: "temperature",
        aggregation: Aggregation::Max,
        state_topic: "homeassistant/sensor/%s/temperature-max/state",
        config_topic: "homeassistant/sensor/%s/temperature-max/config",
        device_class: "temperature",
        name: "Maximum Temperature",
        unit: "℃",
        state_class: Some("measurement"),
    },
    MetricDefinition {
        key: "humidity-min",
        field: "humidity",
        aggregation: Aggregation::Min,
        state_topic: "homeassistant/sensor/%s/humidity-min/state",
        config_topic: "homeassistant/sensor/%s/humidity-min/config",
        device_class: "humidity",
        name: "Minimum Humidity",
        unit: "%",
        state_class: Some("measurement"),
    },
    MetricDefinition {
        key: "humidity-max",
        field: "humidity",
        aggregation: Aggregation::Max,
        state_topic: "homeassistant/sensor/%s/humidity-max/state",
        config_topic: "homeassistant/sensor/%s/humidity-max/config",
        device_class: "humidity",
        name: "Maximum Humidity",
        unit: "%",
        state_class: Some("measurement"),
    },
    MetricDefinition {
        key: "pressure-min",
        field: "pressure",
        aggregation: Aggregation::Min,
        state_topic: "homeassistant/sensor/%s/pressure-min/state",
        config_topic: "homeassistant/sensor/%s/pressure-min/config",
        device_class: "pressure",
        name: "Minimum Pressure",
        unit: "hPa",
        state_class: Some("measurement"),
    },
    MetricDefinition {
        key: "pressure-max",
        field: "pressure",
        aggregation: Aggregation::Max,
        state_topic: "homeassistant/sensor/%s/pressure-max/state",
        config_topic: "homeassistant/sensor/%s/pressure-max/config",
        device_class: "pressure",
        name: "Maximum Pressure",
        unit: "hPa",
        state_class: Some("measurement"),
    },
];

/// Substitute the sensor id into a `%s` topic template
pub fn render_topic(template: &str, sensor_id: &str) -> String {
    template.replacen("%s", sensor_id, 1)
}

/// Metric key of a topic template (`homeassistant/sensor/%s/<key>/state`),
/// empty when the topic is too short
pub fn extract_metric_key(topic: &str) -> &str {
    topic.split('/').nth(3).unwrap_or("")
}

/// State payload: fixed two decimal places
pub fn format_reading(value: f64) -> String {
    format!("{:.2}", value)
}
