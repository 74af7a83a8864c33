/*!
Mock MQTT client for development without a broker

Records every published message in order and acknowledges it immediately.
Topics can be marked as failing to exercise error paths.
*/

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use weather_bridge::mqtt::{PublishError, StatePublisher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl MockMessage {
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

/// Capturing stand-in for the broker connection
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failing_topics: Arc<Mutex<HashSet<String>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later publish on `topic` fails as if the event loop had stopped
    pub fn fail_on<S: Into<String>>(&self, topic: S) {
        self.failing_topics.lock().unwrap().insert(topic.into());
    }

    /// All published messages, in publish order
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// (topic, payload, retain) triples, convenient for ordered assertions
    pub fn published_sequence(&self) -> Vec<(String, String, bool)> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .map(|msg| (msg.topic.clone(), msg.payload_str().to_string(), msg.retain))
            .collect()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse the last message of a topic as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
    }
}

#[async_trait]
impl StatePublisher for MockMqttClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), PublishError> {
        if self.failing_topics.lock().unwrap().contains(topic) {
            log::warn!("❌ [MOCK] Publish to {} rejected", topic);
            return Err(PublishError::Disconnected);
        }

        let message = MockMessage {
            topic: topic.to_string(),
            payload,
            retain,
        };
        log::info!(
            "📤 [MOCK] Published to {}: {} bytes (retain={})",
            message.topic,
            message.payload.len(),
            retain
        );
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_records_in_order() {
        let client = MockMqttClient::new();

        client.publish("a/b", b"first".to_vec(), true).await.unwrap();
        client.publish("c/d", b"second".to_vec(), false).await.unwrap();

        assert_eq!(
            client.published_sequence(),
            vec![
                ("a/b".to_string(), "first".to_string(), true),
                ("c/d".to_string(), "second".to_string(), false),
            ]
        );
        assert_eq!(client.find_messages_by_topic("c/d").len(), 1);
    }

    #[tokio::test]
    async fn test_failing_topic() {
        let client = MockMqttClient::new();
        client.fail_on("broken/topic");

        assert!(client.publish("broken/topic", b"x".to_vec(), false).await.is_err());
        assert!(client.publish("fine/topic", b"x".to_vec(), false).await.is_ok());
        assert_eq!(client.get_published_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_json_message_parsing() {
        let client = MockMqttClient::new();
        let message = serde_json::json!({ "unique_id": "x-sensor-rain" });
        let payload = serde_json::to_vec(&message).unwrap();
        client.publish("json/topic", payload, true).await.unwrap();

        let parsed: Option<serde_json::Value> = client.get_last_json_message("json/topic").unwrap();
        assert_eq!(parsed.unwrap()["unique_id"], "x-sensor-rain");

        let missing: Option<serde_json::Value> = client.get_last_json_message("nope").unwrap();
        assert!(missing.is_none());
    }
}
