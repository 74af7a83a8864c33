/*!
Scripted time-series store for development without InfluxDB

Values are keyed by (field, aggregation). A field can be made to fail a fixed
number of times, or forever, to exercise the retry policy.
*/

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use weather_bridge::influx::{MetricQuery, MetricSource, QueryError};
use weather_bridge::metrics::Aggregation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Times(u32),
    Always,
}

#[derive(Clone, Default)]
pub struct StubMetricStore {
    values: Arc<Mutex<HashMap<(String, Aggregation), f64>>>,
    failures: Arc<Mutex<HashMap<String, Failure>>>,
    calls: Arc<Mutex<Vec<(String, String, Aggregation)>>>,
}

impl StubMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, field: &str, aggregation: Aggregation, value: f64) -> Self {
        self.values.lock().unwrap().insert((field.to_string(), aggregation), value);
        self
    }

    /// Every query on `field` fails
    pub fn failing(self, field: &str) -> Self {
        self.failures.lock().unwrap().insert(field.to_string(), Failure::Always);
        self
    }

    /// The next `times` queries on `field` fail, later ones succeed
    pub fn failing_times(self, field: &str, times: u32) -> Self {
        self.failures.lock().unwrap().insert(field.to_string(), Failure::Times(times));
        self
    }

    /// (measurement, field, aggregation) of every fetch, in order
    pub fn calls(&self) -> Vec<(String, String, Aggregation)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, field: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(_, f, _)| f == field).count()
    }
}

#[async_trait]
impl MetricSource for StubMetricStore {
    async fn fetch(&self, query: &MetricQuery<'_>) -> Result<f64, QueryError> {
        self.calls.lock().unwrap().push((
            query.measurement.to_string(),
            query.field.to_string(),
            query.aggregation,
        ));

        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(query.field) {
            Some(Failure::Always) => {
                return Err(QueryError::Store(format!("stub: {} unavailable", query.field)));
            }
            Some(Failure::Times(left)) if *left > 0 => {
                *left -= 1;
                return Err(QueryError::Store(format!("stub: {} flaky", query.field)));
            }
            _ => {}
        }
        drop(failures);

        let value = self
            .values
            .lock()
            .unwrap()
            .get(&(query.field.to_string(), query.aggregation))
            .copied()
            .unwrap_or(0.0);
        log::debug!(
            "📊 [STUB] {}({}/{}) = {}",
            query.aggregation,
            query.measurement,
            query.field,
            value
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(field: &str) -> MetricQuery<'_> {
        MetricQuery { measurement: "sensor-data", field, aggregation: Aggregation::Max }
    }

    #[tokio::test]
    async fn test_values_and_defaults() {
        let store = StubMetricStore::new().with_value("wind", Aggregation::Max, 20.0);

        assert_eq!(store.fetch(&query("wind")).await.unwrap(), 20.0);
        assert_eq!(store.fetch(&query("rain")).await.unwrap(), 0.0);
        assert_eq!(store.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_times_then_recovers() {
        let store = StubMetricStore::new()
            .with_value("wind", Aggregation::Max, 7.0)
            .failing_times("wind", 2);

        assert!(store.fetch(&query("wind")).await.is_err());
        assert!(store.fetch(&query("wind")).await.is_err());
        assert_eq!(store.fetch(&query("wind")).await.unwrap(), 7.0);
        assert_eq!(store.calls_for("wind"), 3);
    }
}
