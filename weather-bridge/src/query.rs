//! Metric query client: one aggregation query with bounded retries

use tracing::{debug, info};

use crate::influx::{MetricQuery, MetricSource, QueryError};
use crate::metrics::{Aggregation, MetricDefinition};
use crate::retry::{RetryError, RetryPolicy};

pub type QueryResult = Result<f64, RetryError<QueryError>>;

pub struct MetricQueryClient<S> {
    source: S,
    measurement: String,
    retry: RetryPolicy,
}

impl<S: MetricSource> MetricQueryClient<S> {
    pub fn new(source: S, measurement: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            source,
            measurement: measurement.into(),
            retry,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Aggregate `field` of `measurement` since local midnight. Every call
    /// hits the store; nothing is cached.
    pub async fn query(
        &self,
        measurement: &str,
        field: &str,
        aggregation: Aggregation,
    ) -> QueryResult {
        let request = MetricQuery { measurement, field, aggregation };
        let label = format!("InfluxDB {} of {}/{}", aggregation, measurement, field);
        debug!("Querying {}", label);

        let value = self
            .retry
            .run(&label, |_attempt| self.source.fetch(&request))
            .await?;

        info!(
            "InfluxDB query successful: {}/{} {} = {:.2}",
            measurement, field, aggregation, value
        );
        Ok(value)
    }

    /// Query one catalogue entry against the configured measurement
    pub async fn query_metric(&self, metric: &MetricDefinition) -> QueryResult {
        self.query(&self.measurement, metric.field, metric.aggregation).await
    }
}
