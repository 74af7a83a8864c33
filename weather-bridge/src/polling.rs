//! Polling publisher: every two minutes, query each tracked metric and push
//! the readings to their state topics after an "online" heartbeat.

use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{BridgeConfig, QueryFailurePolicy, POLL_INTERVAL};
use crate::influx::MetricSource;
use crate::metrics::{
    format_reading, render_topic, MetricDefinition, AVAILABILITY_TOPIC, PAYLOAD_ONLINE,
};
use crate::mqtt::StatePublisher;
use crate::query::MetricQueryClient;

/// One value bound for one state topic
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub topic: String,
    pub value: f64,
}

impl SensorReading {
    pub fn payload(&self) -> String {
        format_reading(self.value)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub published: usize,
    /// Queries that exhausted their retries
    pub query_failures: usize,
    /// Readings left out of the cycle (failure policy `skip`)
    pub skipped: usize,
    pub publish_failures: usize,
}

/// Query every metric in order; a failed metric never blocks the others
pub async fn collect_readings<S>(
    queries: &MetricQueryClient<S>,
    metrics: &[MetricDefinition],
    config: &BridgeConfig,
    report: &mut CycleReport,
) -> Vec<SensorReading>
where
    S: MetricSource,
{
    let mut readings = Vec::with_capacity(metrics.len());
    for metric in metrics {
        let value = match queries.query_metric(metric).await {
            Ok(value) => value,
            Err(e) => {
                report.query_failures += 1;
                match config.on_query_failure {
                    QueryFailurePolicy::PublishZero => {
                        warn!("Error querying {} data, publishing 0: {}", metric.key, e);
                        0.0
                    }
                    QueryFailurePolicy::Skip => {
                        warn!("Error querying {} data, skipping this cycle: {}", metric.key, e);
                        report.skipped += 1;
                        continue;
                    }
                }
            }
        };
        readings.push(SensorReading {
            topic: metric.state_topic_for(&config.mqtt.sensor_id),
            value,
        });
    }
    readings
}

/// One full cycle: query everything, then publish "online" (retained)
/// followed by each reading (not retained)
pub async fn run_poll_cycle<S, P>(
    queries: &MetricQueryClient<S>,
    publisher: &P,
    metrics: &[MetricDefinition],
    config: &BridgeConfig,
) -> CycleReport
where
    S: MetricSource,
    P: StatePublisher + ?Sized,
{
    let mut report = CycleReport::default();
    let readings = collect_readings(queries, metrics, config, &mut report).await;

    let availability = render_topic(AVAILABILITY_TOPIC, &config.mqtt.sensor_id);
    if let Err(e) = publisher.publish(&availability, PAYLOAD_ONLINE.into(), true).await {
        report.publish_failures += 1;
        warn!("Failed to publish availability on {}: {}", availability, e);
    }

    for reading in readings {
        let payload = reading.payload();
        match publisher.publish(&reading.topic, payload.clone().into_bytes(), false).await {
            Ok(()) => {
                report.published += 1;
                info!("Published to {}: {}", reading.topic, payload);
            }
            Err(e) => {
                report.publish_failures += 1;
                warn!("Failed to publish {} to {}: {}", payload, reading.topic, e);
            }
        }
    }

    report
}

/// Main activity of the process; never returns
pub async fn run_polling_loop<S, P>(
    queries: MetricQueryClient<S>,
    publisher: &P,
    metrics: &[MetricDefinition],
    config: &BridgeConfig,
) where
    S: MetricSource,
    P: StatePublisher + ?Sized,
{
    info!("Entering MQTT publishing loop (every {:?})...", POLL_INTERVAL);
    let mut timer = interval(POLL_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;
        let report = run_poll_cycle(&queries, publisher, metrics, config).await;
        info!(
            "Poll cycle done ({} published, {} query failures, {} skipped, {} publish failures)",
            report.published, report.query_failures, report.skipped, report.publish_failures
        );
    }
}
