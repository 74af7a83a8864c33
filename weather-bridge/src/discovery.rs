//! Home Assistant MQTT discovery
//!
//! One retained config message per tracked metric, published at startup and
//! republished every 12 hours so Home Assistant recreates the entities after
//! its own restarts. Payloads are a pure function of the metric definition and
//! the configuration: no timestamps, no random ids.

use serde::Serialize;
use std::sync::Arc;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::{BridgeConfig, DISCOVERY_INTERVAL};
use crate::metrics::{
    render_topic, MetricDefinition, AVAILABILITY_TOPIC, PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};
use crate::mqtt::StatePublisher;

pub const VALUE_TEMPLATE: &str = "{{ value | float }}";

/// Discovery config payload (matches the HA `sensor` MQTT schema)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryConfig {
    pub device_class: String,
    pub name: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    pub unit_of_measurement: String,
    pub value_template: String,
    pub unique_id: String,
    pub availability_topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub name: String,
    pub suggested_area: String,
    pub identifiers: String,
}

/// Outcome of one discovery pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub published: usize,
    pub failed: usize,
}

impl DiscoveryConfig {
    pub fn for_metric(metric: &MetricDefinition, config: &BridgeConfig) -> Self {
        let sensor_id = &config.mqtt.sensor_id;
        Self {
            device_class: metric.device_class.to_string(),
            name: metric.name.to_string(),
            state_topic: metric.state_topic_for(sensor_id),
            state_class: metric.state_class.map(str::to_string),
            unit_of_measurement: metric.unit.to_string(),
            value_template: VALUE_TEMPLATE.to_string(),
            unique_id: metric.unique_id_for(sensor_id),
            availability_topic: render_topic(AVAILABILITY_TOPIC, sensor_id),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: Some(Device {
                name: config.device.name.clone(),
                suggested_area: config.device.suggested_area.clone(),
                identifiers: sensor_id.clone(),
            }),
        }
    }
}

/// (config topic, serialized payload) for every metric, skipping any whose
/// payload fails to serialize
pub fn build_discovery_messages(
    metrics: &[MetricDefinition],
    config: &BridgeConfig,
) -> Vec<(String, Vec<u8>)> {
    metrics
        .iter()
        .filter_map(|metric| {
            let payload = DiscoveryConfig::for_metric(metric, config);
            match serde_json::to_vec(&payload) {
                Ok(bytes) => Some((metric.config_topic_for(&config.mqtt.sensor_id), bytes)),
                Err(e) => {
                    error!("Error serializing discovery config for {}: {}", metric.name, e);
                    None
                }
            }
        })
        .collect()
}

/// Publish every discovery config (retained), one acknowledged message at a
/// time. A failed publish is logged and does not stop the others.
pub async fn publish_discovery<P>(
    publisher: &P,
    metrics: &[MetricDefinition],
    config: &BridgeConfig,
) -> DiscoveryReport
where
    P: StatePublisher + ?Sized,
{
    info!("Publishing MQTT discovery config...");
    let messages = build_discovery_messages(metrics, config);
    let mut report = DiscoveryReport {
        failed: metrics.len() - messages.len(),
        ..Default::default()
    };

    for (topic, payload) in messages {
        match publisher.publish(&topic, payload, true).await {
            Ok(()) => {
                report.published += 1;
                info!("Home Assistant discovery config sent on {}", topic);
            }
            Err(e) => {
                report.failed += 1;
                warn!("Failed to publish discovery config on {}: {}", topic, e);
            }
        }
    }

    info!("Discovery pass done ({} published, {} failed)", report.published, report.failed);
    report
}

/// Republish discovery every 12 hours; the startup publish is done by the caller
pub fn spawn_discovery_republisher<P>(
    publisher: Arc<P>,
    metrics: &'static [MetricDefinition],
    config: Arc<BridgeConfig>,
) -> JoinHandle<()>
where
    P: StatePublisher + 'static,
{
    task::spawn(async move {
        let mut timer = interval(DISCOVERY_INTERVAL);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick is immediate
        timer.tick().await;

        loop {
            timer.tick().await;
            info!("Republishing MQTT discovery config...");
            publish_discovery(&*publisher, metrics, &config).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::WEATHER_METRICS;
    use crate::mqtt::PublishError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Vec<u8>, bool)>>,
        fail_topic: Option<String>,
    }

    #[async_trait]
    impl StatePublisher for Recorder {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            retain: bool,
        ) -> Result<(), PublishError> {
            if self.fail_topic.as_deref() == Some(topic) {
                return Err(PublishError::Disconnected);
            }
            self.sent.lock().unwrap().push((topic.to_string(), payload, retain));
            Ok(())
        }
    }

    fn config() -> BridgeConfig {
        let lookup = |key: &str| (key == "MQTT_SENSOR").then(|| "weather-import".to_string());
        BridgeConfig::from_lookup(lookup).unwrap()
    }

    #[test]
    fn test_rain_payload_fields() {
        let payload = DiscoveryConfig::for_metric(&WEATHER_METRICS[0], &config());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["device_class"], "precipitation");
        assert_eq!(json["name"], "Rainfall Sensor");
        assert_eq!(json["state_topic"], "homeassistant/sensor/weather-import/rain/state");
        assert_eq!(json["state_class"], "total_increasing");
        assert_eq!(json["unit_of_measurement"], "mm");
        assert_eq!(json["value_template"], "{{ value | float }}");
        assert_eq!(json["unique_id"], "weather-import-sensor-rain");
        assert_eq!(json["availability_topic"], "homeassistant/sensor/weather-import/availability");
        assert_eq!(json["payload_available"], "online");
        assert_eq!(json["payload_not_available"], "offline");
        assert_eq!(json["device"]["identifiers"], "weather-import");
        assert_eq!(json["device"]["suggested_area"], "Garage");
    }

    #[test]
    fn test_optional_fields_omitted() {
        let mut payload = DiscoveryConfig::for_metric(&WEATHER_METRICS[1], &config());
        payload.state_class = None;
        payload.device = None;
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("state_class").is_none());
        assert!(json.get("device").is_none());
    }

    #[tokio::test]
    async fn test_one_retained_config_per_metric() {
        let recorder = Recorder::default();
        let report = publish_discovery(&recorder, WEATHER_METRICS, &config()).await;

        assert_eq!(report, DiscoveryReport { published: WEATHER_METRICS.len(), failed: 0 });
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), WEATHER_METRICS.len());
        assert!(sent.iter().all(|(_, _, retain)| *retain));
        assert_eq!(sent[0].0, "homeassistant/sensor/weather-import/rain/config");
    }

    #[tokio::test]
    async fn test_failed_publish_does_not_abort_pass() {
        let recorder = Recorder {
            fail_topic: Some("homeassistant/sensor/weather-import/wind-max/config".into()),
            ..Default::default()
        };
        let report = publish_discovery(&recorder, WEATHER_METRICS, &config()).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.published, WEATHER_METRICS.len() - 1);
        assert_eq!(recorder.sent.lock().unwrap().len(), WEATHER_METRICS.len() - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_republisher_runs_every_discovery_interval() {
        let recorder = Arc::new(Recorder::default());
        let config = Arc::new(config());
        let handle = spawn_discovery_republisher(recorder.clone(), WEATHER_METRICS, config);
        let sent = || recorder.sent.lock().unwrap().len();

        // the startup pass belongs to the caller
        tokio::time::sleep(DISCOVERY_INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(sent(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sent(), WEATHER_METRICS.len());

        tokio::time::sleep(DISCOVERY_INTERVAL).await;
        assert_eq!(sent(), 2 * WEATHER_METRICS.len());
        handle.abort();
    }

    #[test]
    fn test_payloads_are_deterministic() {
        let first = build_discovery_messages(WEATHER_METRICS, &config());
        let second = build_discovery_messages(WEATHER_METRICS, &config());
        assert_eq!(first, second);
    }
}
