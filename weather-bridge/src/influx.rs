//! InfluxDB v2 backend: Flux aggregation queries over HTTP
//!
//! One request per call, no connection reuse: the polling cadence is a handful
//! of queries every two minutes. The CSV result stream is scanned for the
//! `_value` column and the last value wins.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, SecondsFormat, TimeDelta, TimeZone};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::InfluxConfig;
use crate::metrics::Aggregation;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("InfluxDB returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("InfluxDB query error: {0}")]
    Store(String),
    #[error("CSV decode error: {0}")]
    Csv(#[from] csv::Error),
    #[error("non-numeric _value '{0}'")]
    NonNumeric(String),
}

/// (measurement, field, aggregation) triple for one reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricQuery<'a> {
    pub measurement: &'a str,
    pub field: &'a str,
    pub aggregation: Aggregation,
}

/// Single-attempt access to the time-series store
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(&self, query: &MetricQuery<'_>) -> Result<f64, QueryError>;
}

#[derive(Debug, Serialize)]
struct FluxRequest<'a> {
    query: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    dialect: FluxDialect,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FluxDialect {
    header: bool,
    annotations: [&'static str; 0],
    comment_prefix: &'static str,
}

/// Flux-over-HTTP client for the InfluxDB v2 `/api/v2/query` endpoint
#[derive(Debug, Clone)]
pub struct FluxHttpSource {
    config: InfluxConfig,
}

impl FluxHttpSource {
    pub fn new(config: InfluxConfig) -> Self {
        Self { config }
    }

    fn query_url(&self) -> String {
        format!("{}/api/v2/query", self.config.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl MetricSource for FluxHttpSource {
    async fn fetch(&self, query: &MetricQuery<'_>) -> Result<f64, QueryError> {
        let start = local_midnight(&Local::now());
        let flux = build_flux_query(&self.config.bucket, &start, query);
        debug!("Flux query: {}", flux);

        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let response = http
            .post(self.query_url())
            .query(&[("org", self.config.org.as_str())])
            .header(AUTHORIZATION, format!("Token {}", self.config.token))
            .header(ACCEPT, "application/csv")
            .json(&FluxRequest {
                query: &flux,
                kind: "flux",
                dialect: FluxDialect { header: true, annotations: [], comment_prefix: "#" },
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        match parse_flux_csv(&body)? {
            Some(value) => Ok(value),
            None => {
                debug!(
                    "no {} points since midnight for {}/{}",
                    query.aggregation, query.measurement, query.field
                );
                Ok(0.0)
            }
        }
    }
}

/// Midnight of `now`'s calendar day in `now`'s timezone.
///
/// When midnight falls in a DST gap the first valid hour after it is used.
pub fn local_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    let at_hour = |h| tz.from_local_datetime(&(midnight + TimeDelta::hours(h))).earliest();
    (0..=3).find_map(at_hour).unwrap_or_else(|| now.clone())
}

pub fn build_flux_query<Tz: TimeZone>(
    bucket: &str,
    start: &DateTime<Tz>,
    query: &MetricQuery<'_>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
    [
        format!("from(bucket: \"{}\")", flux_string(bucket)),
        format!("range(start: {})", start),
        format!("filter(fn: (r) => r._measurement == \"{}\")", flux_string(query.measurement)),
        format!("filter(fn: (r) => r._field == \"{}\")", flux_string(query.field)),
        format!("{}()", query.aggregation.flux_fn()),
    ]
    .join("\n  |> ")
}

fn flux_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Last `_value` of a Flux CSV response, `None` when there are no rows.
///
/// Tables may repeat their header row; an `error,reference` table is turned
/// into [`QueryError::Store`].
pub fn parse_flux_csv(body: &str) -> Result<Option<f64>, QueryError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());

    let mut value_col: Option<usize> = None;
    let mut in_error_table = false;
    let mut last = None;

    for record in reader.records() {
        let record = record?;

        if let Some(idx) = record.iter().position(|f| f == "_value") {
            value_col = Some(idx);
            in_error_table = false;
            continue;
        }
        if record.get(0) == Some("error") && record.get(1) == Some("reference") {
            in_error_table = true;
            continue;
        }
        if in_error_table {
            return Err(QueryError::Store(record.get(0).unwrap_or_default().to_string()));
        }

        let Some(raw) = value_col.and_then(|idx| record.get(idx)) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        last = Some(raw.parse::<f64>().map_err(|_| QueryError::NonNumeric(raw.to_string()))?);
    }

    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn rain_query() -> MetricQuery<'static> {
        MetricQuery { measurement: "sensor-data", field: "rain", aggregation: Aggregation::Sum }
    }

    #[test]
    fn test_local_midnight_fixed_offset() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 5, 1, 15, 30, 12).unwrap();
        let midnight = local_midnight(&now);
        assert_eq!(midnight.to_rfc3339(), "2024-05-01T00:00:00+02:00");
    }

    #[test]
    fn test_flux_query_shape() {
        let start = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let flux = build_flux_query("weather", &start, &rain_query());
        assert_eq!(
            flux,
            concat!(
                "from(bucket: \"weather\")\n",
                "  |> range(start: 2024-05-01T00:00:00Z)\n",
                "  |> filter(fn: (r) => r._measurement == \"sensor-data\")\n",
                "  |> filter(fn: (r) => r._field == \"rain\")\n",
                "  |> sum()",
            )
        );
    }

    #[test]
    fn test_flux_query_escapes_quotes() {
        let start = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let query = MetricQuery {
            measurement: "we\"ird",
            field: "f",
            aggregation: Aggregation::Max,
        };
        let flux = build_flux_query("b", &start, &query);
        assert!(flux.contains("r._measurement == \"we\\\"ird\""));
        assert!(flux.ends_with("|> max()"));
    }

    #[test]
    fn test_parse_single_table() {
        let body = ",result,table,_start,_stop,_field,_measurement,_value\n\
                    ,_result,0,2024-05-01T00:00:00Z,2024-05-01T12:00:00Z,rain,sensor-data,5.25\n";
        assert_eq!(parse_flux_csv(body).unwrap(), Some(5.25));
    }

    #[test]
    fn test_parse_multi_table_last_wins() {
        let body = ",result,table,_value\n,_result,0,1.5\n\n\
                    ,result,table,_field,_value\n,_result,1,wind,20\n";
        assert_eq!(parse_flux_csv(body).unwrap(), Some(20.0));
    }

    #[test]
    fn test_parse_empty_body() {
        assert_eq!(parse_flux_csv("").unwrap(), None);
        assert_eq!(parse_flux_csv("\r\n").unwrap(), None);
    }

    #[test]
    fn test_parse_error_table() {
        let body = "error,reference\n\
                    failed to initialize execute state: could not find bucket weather,\n";
        match parse_flux_csv(body) {
            Err(QueryError::Store(msg)) => assert!(msg.ends_with("could not find bucket weather")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_non_numeric_value() {
        let body = ",result,table,_value\n,_result,0,wet\n";
        assert!(matches!(parse_flux_csv(body), Err(QueryError::NonNumeric(v)) if v == "wet"));
    }
}
