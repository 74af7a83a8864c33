/*!
# Weather Bridge DevKit - Stubs and helpers for development

Library for exercising the bridge without external services:
- Capturing MQTT client stub (no broker needed)
- Scripted InfluxDB stub (fixed values, injected failures)
- Test harness wiring both to the real polling/discovery code
*/

pub mod mqtt_stub;
pub mod store_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockMqttClient};
pub use store_stub::StubMetricStore;
pub use test_utils::TestHarness;
