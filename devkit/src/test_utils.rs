/*!
Test harness for the bridge

Wires the capturing MQTT stub and the scripted store into the real discovery
and polling code, plus assertions on what reached the "broker".
*/

use crate::mqtt_stub::MockMqttClient;
use crate::store_stub::StubMetricStore;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use weather_bridge::config::BridgeConfig;
use weather_bridge::discovery::{publish_discovery, DiscoveryReport};
use weather_bridge::metrics::MetricDefinition;
use weather_bridge::polling::{run_poll_cycle, CycleReport};
use weather_bridge::query::MetricQueryClient;
use weather_bridge::retry::RetryPolicy;

pub const TEST_SENSOR_ID: &str = "weather-import";

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub store: StubMetricStore,
    pub config: BridgeConfig,
    pub retry: RetryPolicy,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_env(&[])
    }

    /// Harness whose config sees `overrides` on top of the test sensor id
    pub fn with_env(overrides: &[(&str, &str)]) -> Self {
        env_logger::builder().is_test(true).try_init().ok();

        let mut env: HashMap<String, String> = HashMap::new();
        env.insert("MQTT_SENSOR".into(), TEST_SENSOR_ID.into());
        for (key, value) in overrides {
            env.insert(key.to_string(), value.to_string());
        }

        let config = match BridgeConfig::from_lookup(|key| env.get(key).cloned()) {
            Ok(config) => config,
            Err(e) => panic!("invalid test config: {}", e),
        };

        Self {
            mqtt_client: MockMqttClient::new(),
            store: StubMetricStore::new(),
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_store(mut self, store: StubMetricStore) -> Self {
        self.store = store;
        self
    }

    /// Query client over a clone of the stub store (shared state)
    pub fn query_client(&self) -> MetricQueryClient<StubMetricStore> {
        let measurement = self.config.influx.measurement.clone();
        MetricQueryClient::new(self.store.clone(), measurement, self.retry)
    }

    pub async fn poll_once(&self, metrics: &[MetricDefinition]) -> CycleReport {
        let queries = self.query_client();
        let report = run_poll_cycle(&queries, &self.mqtt_client, metrics, &self.config).await;
        log::info!("🔄 Poll cycle done: {:?}", report);
        report
    }

    pub async fn publish_discovery(&self, metrics: &[MetricDefinition]) -> DiscoveryReport {
        let report = publish_discovery(&self.mqtt_client, metrics, &self.config).await;
        log::info!("📡 Discovery pass done: {:?}", report);
        report
    }

    /// `homeassistant/sensor/<sensor>/...` for the harness sensor id
    pub fn topic(&self, suffix: &str) -> String {
        format!("homeassistant/sensor/{}/{}", self.config.mqtt.sensor_id, suffix)
    }

    /// Payloads published on `topic`, oldest first
    pub fn payloads_on(&self, topic: &str) -> Vec<String> {
        self.mqtt_client
            .find_messages_by_topic(topic)
            .iter()
            .map(|msg| msg.payload_str().to_string())
            .collect()
    }

    pub fn assert_message_sent(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        let found = self
            .mqtt_client
            .find_messages_by_topic(topic)
            .iter()
            .any(|msg| msg.payload_str() == payload && msg.retain == retain);
        if !found {
            anyhow::bail!("No message '{}' (retain={}) on {}", payload, retain, topic);
        }
        log::info!("✅ Found '{}' on {}", payload, topic);
        Ok(())
    }

    /// Compare a dotted path inside the last JSON message on `topic`
    pub fn assert_field_equals(
        &self,
        topic: &str,
        field_path: &str,
        expected: &Value,
    ) -> Result<()> {
        let msg = match self.mqtt_client.get_last_json_message::<Value>(topic)? {
            Some(msg) => msg,
            None => anyhow::bail!("No message on {}", topic),
        };

        let actual = field_path
            .split('.')
            .try_fold(&msg, |current, part| current.get(part));
        match actual {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in {}", field_path, topic),
        }
    }

    pub fn reset(&self) {
        self.mqtt_client.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
