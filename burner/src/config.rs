//! Configuration spec for a run.
//!
//! The configuration file is YAML with a `global` section and an ordered
//! `jobs` list. Profiles (metrics, alerts, endpoints, user metadata) are
//! separate YAML documents referenced from the CLI.
use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while reading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration source could not be read.
    #[error("error reading {source_name}: {reason}")]
    Read {
        /// Path or URL of the configuration source.
        source_name: String,
        /// Underlying failure.
        reason: String,
    },
    /// The configuration could not be decoded.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The configuration decoded but is not a valid run spec.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A complete run declaration.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// Run-level configuration.
    #[serde(default)]
    pub global: GlobalConfig,
    /// Ordered list of jobs to execute.
    #[serde(default)]
    pub jobs: Vec<Job>,
}

/// Run-level configuration.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Run UUID. Supplied by the CLI, generated when absent.
    #[serde(default)]
    pub uuid: String,
    /// Measurements to instantiate for the run.
    #[serde(default)]
    pub measurements: Vec<Measurement>,
    /// Document sink configuration.
    #[serde(default)]
    pub indexer_config: IndexerConfig,
    /// Whether to garbage collect namespaces left over from prior runs
    /// sharing this UUID before starting.
    #[serde(default)]
    pub gc: bool,
}

/// A measurement to run alongside the workload.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// Measurement name. `podLatency` is the only built-in.
    pub name: String,
}

/// Sink variants for produced documents.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexerType {
    /// No indexing.
    #[default]
    None,
    /// Write document batches as JSON files into a local directory.
    Local,
    /// Submit document batches to a remote search index in bulk.
    Elastic,
}

/// Document sink configuration.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexerConfig {
    /// Which sink variant to use.
    #[serde(default, rename = "type")]
    pub indexer_type: IndexerType,
    /// Directory for the local sink.
    #[serde(default = "default_metrics_directory")]
    pub metrics_directory: String,
    /// Endpoints for the remote sink.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Index name for the remote sink.
    #[serde(default)]
    pub index: String,
    /// Skip TLS verification towards the remote sink.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Kinds of work a job performs.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Create objects from rendered templates.
    #[default]
    Create,
    /// Delete objects resolved by selector and kind.
    Delete,
    /// Patch objects resolved by selector and kind.
    Patch,
    /// Read objects resolved by selector and kind.
    Read,
}

/// Retry policy for dispatched API operations.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_retry_base", with = "duration")]
    pub base_delay: Duration,
    /// Backoff ceiling.
    #[serde(default = "default_retry_cap", with = "duration")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay: default_retry_base(),
            max_delay: default_retry_cap(),
        }
    }
}

/// One declared unit of work within a run.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job name. Stamped on every object the job creates.
    pub name: String,
    /// What kind of work the job performs.
    #[serde(default)]
    pub job_type: JobType,
    /// Number of iterations.
    #[serde(default = "default_iterations")]
    pub job_iterations: u32,
    /// Token refill rate for the dispatcher.
    #[serde(default = "default_qps")]
    pub qps: f64,
    /// Token bucket capacity for the dispatcher.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Number of dispatcher workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Whether each iteration gets its own namespace.
    #[serde(default)]
    pub namespaced_iterations: bool,
    /// Namespace, or namespace prefix when `namespaced_iterations` is set.
    /// Defaults to the job name.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Extra labels applied to namespaces created by this job.
    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,
    /// Delete the objects and namespaces created by this job at job end.
    #[serde(default = "default_true")]
    pub cleanup: bool,
    /// Wait for readiness of each iteration's objects before the next one.
    #[serde(default)]
    pub pod_wait: bool,
    /// Wait for readiness of all objects at job end.
    #[serde(default = "default_true")]
    pub wait_when_finished: bool,
    /// Verify final object counts match the declared amount.
    #[serde(default = "default_true")]
    pub verify_objects: bool,
    /// Promote verification and wait failures to job failure.
    #[serde(default)]
    pub error_on_verify: bool,
    /// Pre-pull container images onto every node before the job starts.
    #[serde(default)]
    pub pre_load_images: bool,
    /// How long to let the preload daemonset run.
    #[serde(default = "default_preload_period", with = "duration")]
    pub pre_load_period: Duration,
    /// Readiness wait bound per object. Zero skips waits entirely.
    #[serde(default = "default_max_wait_timeout", with = "duration")]
    pub max_wait_timeout: Duration,
    /// Sleep between iterations.
    #[serde(default, with = "duration")]
    pub job_pause: Duration,
    /// For delete jobs, block until matching objects are gone.
    #[serde(default)]
    pub wait_for_deletion: bool,
    /// A job failure aborts the remaining jobs in the run.
    #[serde(default = "default_true")]
    pub fatal: bool,
    /// Retry policy for dispatched operations.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Ordered object entries.
    #[serde(default)]
    pub objects: Vec<Object>,
}

impl Job {
    /// Namespace base name, defaulting to the job name.
    pub fn namespace_base(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.name)
    }

    /// Namespace for a given iteration under this job's namespacing policy.
    pub fn namespace_for(&self, iteration: u32) -> String {
        let base = self.namespace_base().trim_end_matches('-');
        if self.namespaced_iterations {
            format!("{base}-{iteration}")
        } else {
            base.to_owned()
        }
    }
}

/// Readiness overrides for an object entry.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WaitOptions {
    /// Wait for a status condition of this type to be True instead of the
    /// kind's built-in readiness predicate.
    #[serde(default)]
    pub for_condition: Option<String>,
}

/// One object entry within a job.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    /// Template path or URL. Required for create and patch jobs.
    #[serde(default)]
    pub object_template: Option<String>,
    /// Instances rendered per iteration.
    #[serde(default = "default_iterations")]
    pub replicas: u32,
    /// Free variables exposed to the template.
    #[serde(default)]
    pub input_vars: BTreeMap<String, serde_json::Value>,
    /// Object kind. Required for delete, patch and read jobs.
    #[serde(default)]
    pub kind: Option<String>,
    /// apiVersion of the kind, e.g. `apps/v1`. Defaults to `v1`.
    #[serde(default)]
    pub api_version: Option<String>,
    /// Label selector scoping delete, patch and read jobs.
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    /// Readiness overrides.
    #[serde(default)]
    pub wait_options: WaitOptions,
}

impl Object {
    /// Selector string for list operations.
    pub fn selector(&self) -> String {
        self.label_selector
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// One entry of a metrics profile.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsProfileEntry {
    /// PromQL query to execute.
    pub query: String,
    /// Name documents produced by this entry are indexed under.
    pub metric_name: String,
    /// Issue a single instant query at the window end instead of a range
    /// query.
    #[serde(default)]
    pub instant: bool,
}

/// Severity of an alert profile entry.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Worth attention, non-fatal.
    Warning,
    /// Fails the evaluation with a non-zero exit.
    Critical,
}

impl Severity {
    /// Name as emitted into alert documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// One entry of an alert profile.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AlertProfileEntry {
    /// Boolean PromQL expression. Any series evaluating to a non-zero value
    /// within the window fires the alert.
    pub expr: String,
    /// Alert severity.
    pub severity: Severity,
    /// Description template. `labels` and `value` are in scope.
    pub description: String,
}

/// One Prometheus endpoint from a metrics endpoints file.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEndpoint {
    /// Prometheus base URL.
    pub endpoint: String,
    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,
    /// Basic auth username.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Query step for range queries.
    #[serde(default = "default_step", with = "duration")]
    pub step: Duration,
    /// Skip TLS verification towards the endpoint.
    #[serde(default = "default_true")]
    pub skip_tls_verify: bool,
    /// Per-endpoint metrics profile override.
    #[serde(default)]
    pub metrics_profile: Option<String>,
    /// Per-endpoint alert profile override.
    #[serde(default)]
    pub alert_profile: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_iterations() -> u32 {
    1
}
fn default_qps() -> f64 {
    20.0
}
fn default_burst() -> u32 {
    20
}
fn default_workers() -> usize {
    10
}
fn default_metrics_directory() -> String {
    "collected-metrics".to_owned()
}
fn default_max_wait_timeout() -> Duration {
    Duration::from_secs(4 * 3600)
}
fn default_preload_period() -> Duration {
    Duration::from_secs(30)
}
fn default_step() -> Duration {
    Duration::from_secs(30)
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_base() -> Duration {
    Duration::from_millis(250)
}
fn default_retry_cap() -> Duration {
    Duration::from_secs(4)
}

/// Serde helper accepting durations as plain seconds or `250ms`/`30s`/`5m`/`4h`
/// strings.
mod duration {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    /// Parse a `250ms`/`30s`/`5m`/`4h` style duration string.
    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration {text:?} is missing a unit"))?;
        let (value, unit) = text.split_at(split);
        let value: u64 = value
            .parse()
            .map_err(|_| format!("invalid duration value {text:?}"))?;
        match unit {
            "ms" => Ok(Duration::from_millis(value)),
            "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            other => Err(format!("unknown duration unit {other:?}")),
        }
    }
}

pub use duration::parse as parse_duration;

/// Read a configuration document from a local path or an http(s) URL.
pub async fn read_to_string(source: &str) -> Result<String, ConfigError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let resp = reqwest::get(source).await.map_err(|err| ConfigError::Read {
            source_name: source.to_owned(),
            reason: err.to_string(),
        })?;
        if !resp.status().is_success() {
            return Err(ConfigError::Read {
                source_name: source.to_owned(),
                reason: format!("unexpected status {}", resp.status()),
            });
        }
        resp.text().await.map_err(|err| ConfigError::Read {
            source_name: source.to_owned(),
            reason: err.to_string(),
        })
    } else {
        tokio::fs::read_to_string(source)
            .await
            .map_err(|err| ConfigError::Read {
                source_name: source.to_owned(),
                reason: err.to_string(),
            })
    }
}

/// Parse and validate a run spec, stamping the run UUID.
pub fn parse(uuid: &str, raw: &str) -> Result<Spec, ConfigError> {
    let mut spec: Spec = serde_yaml::from_str(raw)?;
    spec.global.uuid = uuid.to_owned();
    validate(&spec)?;
    Ok(spec)
}

/// Parse a metrics profile document.
pub fn parse_metrics_profile(raw: &str) -> Result<Vec<MetricsProfileEntry>, ConfigError> {
    Ok(serde_yaml::from_str(raw)?)
}

/// Parse an alert profile document.
pub fn parse_alert_profile(raw: &str) -> Result<Vec<AlertProfileEntry>, ConfigError> {
    Ok(serde_yaml::from_str(raw)?)
}

/// Parse a metrics endpoints document.
pub fn parse_metrics_endpoints(raw: &str) -> Result<Vec<MetricsEndpoint>, ConfigError> {
    Ok(serde_yaml::from_str(raw)?)
}

/// Parse a user metadata document into a free field map.
pub fn parse_user_metadata(
    raw: &str,
) -> Result<BTreeMap<String, serde_json::Value>, ConfigError> {
    Ok(serde_yaml::from_str(raw)?)
}

fn validate(spec: &Spec) -> Result<(), ConfigError> {
    let mut seen = std::collections::BTreeSet::new();
    for job in &spec.jobs {
        let invalid = |msg: String| ConfigError::Invalid(format!("job {}: {msg}", job.name));
        if job.name.is_empty() {
            return Err(ConfigError::Invalid("job with empty name".to_owned()));
        }
        if !seen.insert(&job.name) {
            return Err(invalid("duplicate job name".to_owned()));
        }
        if job.qps < 0.0 {
            return Err(invalid(format!("negative qps {}", job.qps)));
        }
        if job.qps == 0.0 && job.burst > 0 {
            return Err(invalid(
                "qps 0 with a non-zero burst would stall after the first burst".to_owned(),
            ));
        }
        if job.workers == 0 {
            return Err(invalid("workers must be at least 1".to_owned()));
        }
        match job.job_type {
            JobType::Create => {
                if job.objects.is_empty() {
                    return Err(invalid("create job without objects".to_owned()));
                }
                for object in &job.objects {
                    if object.object_template.is_none() {
                        return Err(invalid("create object without objectTemplate".to_owned()));
                    }
                    if object.replicas == 0 {
                        return Err(invalid("object with zero replicas".to_owned()));
                    }
                }
            }
            JobType::Patch => {
                for object in &job.objects {
                    if object.object_template.is_none() {
                        return Err(invalid("patch object without objectTemplate".to_owned()));
                    }
                    if object.kind.is_none() || object.label_selector.is_empty() {
                        return Err(invalid(
                            "patch object needs kind and labelSelector".to_owned(),
                        ));
                    }
                }
            }
            JobType::Delete | JobType::Read => {
                for object in &job.objects {
                    if object.kind.is_none() || object.label_selector.is_empty() {
                        return Err(invalid(format!(
                            "{:?} object needs kind and labelSelector",
                            job.job_type
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
global:
  measurements:
    - name: podLatency
  indexerConfig:
    type: local
    metricsDirectory: collected-metrics
jobs:
  - name: api-intensive
    jobIterations: 3
    qps: 2
    burst: 2
    namespacedIterations: true
    namespace: kube-burner
    podWait: true
    cleanup: true
    maxWaitTimeout: 10m
    jobPause: 1s
    objects:
      - objectTemplate: templates/deployment.yml
        replicas: 1
        inputVars:
          image: registry.example.com/busybox:latest
  - name: remove-services
    jobType: delete
    qps: 10
    burst: 10
    waitForDeletion: true
    objects:
      - kind: Service
        apiVersion: v1
        labelSelector:
          kube-burner-job: api-intensive
"#;

    #[test]
    fn parse_full_config() {
        let spec = parse("1f8e", FULL_CONFIG).unwrap();
        assert_eq!(spec.global.uuid, "1f8e");
        assert_eq!(spec.global.measurements, vec![Measurement {
            name: "podLatency".to_owned()
        }]);
        assert_eq!(spec.global.indexer_config.indexer_type, IndexerType::Local);
        assert_eq!(spec.jobs.len(), 2);

        let create = &spec.jobs[0];
        assert_eq!(create.job_type, JobType::Create);
        assert_eq!(create.job_iterations, 3);
        assert_eq!(create.qps, 2.0);
        assert!(create.namespaced_iterations);
        assert_eq!(create.namespace_for(2), "kube-burner-2");
        assert_eq!(create.max_wait_timeout, Duration::from_secs(600));
        assert_eq!(create.job_pause, Duration::from_secs(1));
        // Defaults
        assert!(create.wait_when_finished);
        assert!(create.verify_objects);
        assert!(!create.error_on_verify);
        assert_eq!(create.retry, RetryPolicy::default());

        let delete = &spec.jobs[1];
        assert_eq!(delete.job_type, JobType::Delete);
        assert!(delete.wait_for_deletion);
        assert_eq!(
            delete.objects[0].selector(),
            "kube-burner-job=api-intensive"
        );
    }

    #[test]
    fn namespace_defaults_to_job_name() {
        let spec = parse(
            "u",
            r#"
jobs:
  - name: not-namespaced
    objects:
      - objectTemplate: t.yml
"#,
        )
        .unwrap();
        assert_eq!(spec.jobs[0].namespace_for(1), "not-namespaced");
    }

    #[test]
    fn zero_qps_with_burst_is_rejected() {
        let err = parse(
            "u",
            r#"
jobs:
  - name: stalled
    qps: 0
    burst: 5
    objects:
      - objectTemplate: t.yml
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn delete_without_selector_is_rejected() {
        let err = parse(
            "u",
            r#"
jobs:
  - name: nuke
    jobType: delete
    objects:
      - kind: Pod
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let err = parse(
            "u",
            r#"
jobs:
  - name: twice
    objects:
      - objectTemplate: t.yml
  - name: twice
    objects:
      - objectTemplate: t.yml
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn durations_parse_units_and_plain_seconds() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("4h").unwrap(), Duration::from_secs(14400));
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn parse_profiles() {
        let metrics = parse_metrics_profile(
            r#"
- query: sum(rate(apiserver_request_total[2m]))
  metricName: apiRequestRate
- query: count(kube_pod_info)
  metricName: podCount
  instant: true
"#,
        )
        .unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(!metrics[0].instant);
        assert!(metrics[1].instant);

        let alerts = parse_alert_profile(
            r#"
- expr: up{job="apiserver"} == 0
  severity: critical
  description: apiserver {{ labels.instance }} is down
- expr: increase(apiserver_request_total{code="500"}[5m]) > 0
  severity: warning
  description: 5xx responses seen
"#,
        )
        .unwrap();
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[1].severity, Severity::Warning);

        let endpoints = parse_metrics_endpoints(
            r#"
- endpoint: https://prometheus.example.com
  token: sha256~secret
  step: 1m
- endpoint: http://localhost:9090
"#,
        )
        .unwrap();
        assert_eq!(endpoints[0].step, Duration::from_secs(60));
        assert_eq!(endpoints[1].step, Duration::from_secs(30));
        assert!(endpoints[1].skip_tls_verify);
    }
}
