//! Prometheus querying and metrics-profile scraping.
//!
//! After a run (or stand-alone), every profile entry is executed over the
//! recorded time window and normalized into documents for the indexer. A
//! failing query is logged and skipped; a failing endpoint is retried a
//! bounded number of times and then dropped with its remaining queries.
use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::MetricsProfileEntry,
    indexers::{Indexer, IndexingOpts},
};

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Errors produced while querying Prometheus.
#[derive(Debug, Error)]
pub enum PrometheusError {
    /// The endpoint could not be reached.
    #[error("prometheus endpoint unreachable: {0}")]
    Unreachable(String),
    /// The endpoint answered but the query failed.
    #[error("query {query:?} failed: {reason}")]
    Query {
        /// The PromQL expression.
        query: String,
        /// Failure detail.
        reason: String,
    },
    /// The response body could not be decoded.
    #[error("failed to parse response: {0}")]
    Parse(String),
    /// The client could not be constructed.
    #[error("prometheus client error: {0}")]
    Client(String),
}

/// Authentication towards one endpoint.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    /// Bearer token.
    pub token: Option<String>,
    /// Basic auth username.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
    /// Skip TLS verification.
    pub skip_tls_verify: bool,
}

/// One series returned by the query API.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Series {
    /// Label set identifying the series.
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    /// Sample of an instant query.
    #[serde(default)]
    pub value: Option<(f64, String)>,
    /// Samples of a range query.
    #[serde(default)]
    pub values: Vec<(f64, String)>,
}

impl Series {
    /// All samples of the series, regardless of query type.
    pub fn samples(&self) -> Vec<(f64, f64)> {
        let parse = |(ts, val): &(f64, String)| val.parse::<f64>().ok().map(|v| (*ts, v));
        match &self.value {
            Some(sample) => parse(sample).into_iter().collect(),
            None => self.values.iter().filter_map(parse).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiData {
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<ApiData>,
}

/// Decode a query API response body into its series.
pub fn parse_response(query: &str, body: &str) -> Result<Vec<Series>, PrometheusError> {
    let response: ApiResponse =
        serde_json::from_str(body).map_err(|err| PrometheusError::Parse(err.to_string()))?;
    if response.status != "success" {
        return Err(PrometheusError::Query {
            query: query.to_owned(),
            reason: response.error.unwrap_or_else(|| response.status.clone()),
        });
    }
    Ok(response.data.map(|data| data.result).unwrap_or_default())
}

/// Client for one Prometheus endpoint.
#[derive(Debug)]
pub struct Client {
    base: String,
    http: reqwest::Client,
    auth: Auth,
    /// Query step for range queries.
    pub step: Duration,
}

impl Client {
    /// Build a client for the endpoint.
    pub fn new(url: &str, auth: Auth, step: Duration) -> Result<Self, PrometheusError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(auth.skip_tls_verify)
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| PrometheusError::Client(err.to_string()))?;
        Ok(Self {
            base: url.trim_end_matches('/').to_owned(),
            http,
            auth,
            step,
        })
    }

    /// Endpoint base URL.
    pub fn endpoint(&self) -> &str {
        &self.base
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<String, PrometheusError> {
        let url = format!("{}{path}", self.base);
        let mut attempt = 1;
        loop {
            let mut request = self.http.get(&url).query(params);
            if let Some(token) = &self.auth.token {
                request = request.bearer_auth(token);
            } else if let Some(username) = &self.auth.username {
                request = request.basic_auth(username, self.auth.password.as_deref());
            }
            match request.send().await {
                Ok(resp) => {
                    // Prometheus carries query errors in the JSON body even
                    // for non-2xx answers
                    return resp
                        .text()
                        .await
                        .map_err(|err| PrometheusError::Unreachable(err.to_string()));
                }
                Err(err) if attempt < CONNECT_ATTEMPTS => {
                    warn!(endpoint = self.base, attempt, %err, "endpoint unreachable, retrying");
                    attempt += 1;
                    sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(err) => return Err(PrometheusError::Unreachable(err.to_string())),
            }
        }
    }

    /// Range query over [start, end] with this client's step.
    pub async fn range_query(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Series>, PrometheusError> {
        let body = self
            .get(
                "/api/v1/query_range",
                &[
                    ("query", query.to_owned()),
                    ("start", start.timestamp().to_string()),
                    ("end", end.timestamp().to_string()),
                    ("step", format!("{}s", self.step.as_secs().max(1))),
                ],
            )
            .await?;
        parse_response(query, &body)
    }

    /// Instant query at the given time.
    pub async fn instant_query(
        &self,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Series>, PrometheusError> {
        let body = self
            .get(
                "/api/v1/query",
                &[
                    ("query", query.to_owned()),
                    ("time", at.timestamp().to_string()),
                ],
            )
            .await?;
        parse_response(query, &body)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricDocument<'a> {
    timestamp: String,
    labels: &'a BTreeMap<String, String>,
    value: f64,
    uuid: &'a str,
    query: &'a str,
    metric_name: &'a str,
    job_name: &'a str,
    #[serde(flatten)]
    metadata: &'a BTreeMap<String, Value>,
}

/// Normalize query results into indexable documents.
///
/// `endpoint_label` distinguishes results when several endpoints are scraped.
pub fn documents_from_series(
    entry: &MetricsProfileEntry,
    series: &mut [Series],
    endpoint_label: &str,
    uuid: &str,
    job_name: &str,
    metadata: &BTreeMap<String, Value>,
) -> Vec<Value> {
    let mut documents = Vec::new();
    for series in series.iter_mut() {
        series
            .metric
            .insert("endpoint".to_owned(), endpoint_label.to_owned());
        for (ts, value) in series.samples() {
            if !value.is_finite() {
                continue;
            }
            let timestamp = DateTime::from_timestamp(ts as i64, 0)
                .unwrap_or_else(Utc::now)
                .to_rfc3339();
            let document = MetricDocument {
                timestamp,
                labels: &series.metric,
                value,
                uuid,
                query: &entry.query,
                metric_name: &entry.metric_name,
                job_name,
                metadata,
            };
            if let Ok(value) = serde_json::to_value(&document) {
                documents.push(value);
            }
        }
    }
    documents
}

/// Execute a metrics profile against one endpoint and index the results.
///
/// Returns the number of documents produced. A failing entry is skipped; an
/// unreachable endpoint aborts its remaining entries.
#[allow(clippy::too_many_arguments)]
pub async fn scrape(
    client: &Client,
    profile: &[MetricsProfileEntry],
    uuid: &str,
    job_name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    metadata: &BTreeMap<String, Value>,
    indexer: Option<&Indexer>,
) -> Result<usize, PrometheusError> {
    let mut total = 0;
    info!(
        endpoint = client.endpoint(),
        entries = profile.len(),
        "scraping metrics profile"
    );
    for entry in profile {
        let result = if entry.instant {
            client.instant_query(&entry.query, end).await
        } else {
            client.range_query(&entry.query, start, end).await
        };
        let mut series = match result {
            Ok(series) => series,
            Err(err @ PrometheusError::Unreachable(_)) => {
                // Connectivity is gone, drop the endpoint's remaining queries
                return Err(err);
            }
            Err(err) => {
                warn!(metric = entry.metric_name, %err, "skipping profile entry");
                continue;
            }
        };
        let documents = documents_from_series(
            entry,
            &mut series,
            client.endpoint(),
            uuid,
            job_name,
            metadata,
        );
        debug!(
            metric = entry.metric_name,
            documents = documents.len(),
            "scraped profile entry"
        );
        total += documents.len();
        if let Some(indexer) = indexer {
            let opts = IndexingOpts {
                metric_name: entry.metric_name.clone(),
                job_name: job_name.to_owned(),
            };
            if let Err(err) = indexer.index(&documents, &opts).await {
                warn!(metric = entry.metric_name, %err, "failed to index scraped documents");
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, instant: bool) -> MetricsProfileEntry {
        MetricsProfileEntry {
            query: "sum(rate(foo[5m]))".to_owned(),
            metric_name: name.to_owned(),
            instant,
        }
    }

    #[test]
    fn parse_range_response() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {
                        "metric": {"instance": "node-a"},
                        "values": [[1700000000, "1.5"], [1700000030, "2.5"]]
                    }
                ]
            }
        }"#;
        let series = parse_response("q", body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].metric["instance"], "node-a");
        assert_eq!(
            series[0].samples(),
            vec![(1_700_000_000.0, 1.5), (1_700_000_030.0, 2.5)]
        );
    }

    #[test]
    fn parse_instant_response() {
        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{"metric": {}, "value": [1700000000, "12.5"]}]
            }
        }"#;
        let series = parse_response("q", body).unwrap();
        assert_eq!(series[0].samples(), vec![(1_700_000_000.0, 12.5)]);
    }

    #[test]
    fn parse_error_response() {
        let body = r#"{"status": "error", "error": "parse error at char 4", "data": null}"#;
        let err = parse_response("sum(", body).unwrap_err();
        assert!(matches!(err, PrometheusError::Query { .. }));
    }

    #[test]
    fn parse_garbage_response() {
        assert!(matches!(
            parse_response("q", "<html>gateway timeout</html>"),
            Err(PrometheusError::Parse(_))
        ));
    }

    #[test]
    fn documents_carry_identity_and_endpoint_label() {
        let mut series = vec![Series {
            metric: BTreeMap::from_iter(vec![("instance".to_owned(), "node-a".to_owned())]),
            value: None,
            values: vec![(1_700_000_000.0, "3.0".to_owned())],
        }];
        let metadata = BTreeMap::from_iter(vec![("ocpVersion".to_owned(), Value::from("4.14"))]);
        let documents = documents_from_series(
            &entry("apiRequestRate", false),
            &mut series,
            "https://prom-a",
            "1f8e",
            "kube-burner-indexing",
            &metadata,
        );
        assert_eq!(documents.len(), 1);
        let doc = &documents[0];
        assert_eq!(doc["metricName"], "apiRequestRate");
        assert_eq!(doc["jobName"], "kube-burner-indexing");
        assert_eq!(doc["uuid"], "1f8e");
        assert_eq!(doc["value"], 3.0);
        assert_eq!(doc["labels"]["instance"], "node-a");
        assert_eq!(doc["labels"]["endpoint"], "https://prom-a");
        assert_eq!(doc["ocpVersion"], "4.14");
    }

    #[test]
    fn one_document_per_sample() {
        let mut series = vec![Series {
            metric: BTreeMap::new(),
            value: None,
            values: (0..121)
                .map(|i| (1_700_000_000.0 + (i * 30) as f64, "1".to_owned()))
                .collect(),
        }];
        let documents = documents_from_series(
            &entry("foo", false),
            &mut series,
            "prom",
            "1f8e",
            "kube-burner-indexing",
            &BTreeMap::new(),
        );
        assert_eq!(documents.len(), 121);
    }

    #[test]
    fn nan_samples_are_dropped() {
        let mut series = vec![Series {
            metric: BTreeMap::new(),
            value: Some((1_700_000_000.0, "NaN".to_owned())),
            values: vec![],
        }];
        let documents = documents_from_series(
            &entry("foo", true),
            &mut series,
            "prom",
            "1f8e",
            "job",
            &BTreeMap::new(),
        );
        assert!(documents.is_empty());
    }
}
