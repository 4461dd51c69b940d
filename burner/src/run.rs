//! Run controller.
//!
//! Owns the run UUID and timeout, sequences jobs strictly in declared order,
//! brackets them with the measurement subsystem, and drives the metrics
//! scrape plus alert evaluation over the recorded window.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use k8s_openapi::chrono::Utc;
use kube::Client;
use kube_burner_common::labels::uuid_selector;
use serde::Serialize;
use serde_json::Value;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    alerting::AlertManager,
    config::{MetricsProfileEntry, Spec},
    indexers::{Indexer, IndexingOpts},
    job::{JobExecutor, JobOutcome, JobState},
    measurements::Measurements,
    prometheus,
};

/// Process exit codes, encoding the failure class.
pub mod codes {
    /// Clean completion.
    pub const SUCCESS: i32 = 0;
    /// Unclassified failure.
    pub const GENERIC: i32 = 1;
    /// Malformed or invalid configuration.
    pub const CONFIG: i32 = 2;
    /// A job failed on API errors or verification.
    pub const API: i32 = 3;
    /// The measurement subsystem failed.
    pub const MEASUREMENT: i32 = 4;
    /// The run timeout expired.
    pub const TIMEOUT: i32 = 5;
    /// At least one critical alert fired.
    pub const ALERT_CRITICAL: i32 = 6;
}

/// One Prometheus endpoint with its profiles, ready to scrape.
pub struct ScrapeTarget {
    /// Query client for the endpoint.
    pub client: prometheus::Client,
    /// Metrics profile to execute.
    pub profile: Vec<MetricsProfileEntry>,
    /// Alert profile evaluator, when configured.
    pub alerts: Option<AlertManager>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobSummary<'a> {
    timestamp: String,
    uuid: &'a str,
    job_name: &'a str,
    elapsed_time: f64,
    job_state: &'static str,
    metric_name: &'static str,
    #[serde(flatten)]
    metadata: &'a BTreeMap<String, Value>,
}

fn job_summary_doc(outcome: &JobOutcome, uuid: &str, metadata: &BTreeMap<String, Value>) -> Value {
    serde_json::to_value(JobSummary {
        timestamp: outcome.start.to_rfc3339(),
        uuid,
        job_name: &outcome.name,
        elapsed_time: (outcome.end - outcome.start).num_milliseconds() as f64 / 1000.0,
        job_state: outcome.state.as_str(),
        metric_name: "jobSummary",
        metadata,
    })
    .unwrap_or_default()
}

/// Execute a run: jobs, measurements, scrape, alerts.
///
/// Returns the process exit code.
pub async fn run(
    spec: &Spec,
    client: Client,
    scrape_targets: Vec<ScrapeTarget>,
    indexer: Option<Arc<Indexer>>,
    timeout: Duration,
    metadata: BTreeMap<String, Value>,
    cancel: CancellationToken,
) -> i32 {
    let uuid = spec.global.uuid.clone();
    info!(uuid, jobs = spec.jobs.len(), "starting run");
    let run_start = Utc::now();

    if spec.global.gc {
        info!(uuid, "garbage collecting leftovers from previous runs");
        if let Err(err) = crate::job::namespaces::cleanup_namespaces(
            &client,
            &uuid_selector(&uuid),
            Duration::from_secs(300),
            &cancel,
        )
        .await
        {
            warn!(%err, "pre-run garbage collection failed");
        }
    }

    // Measurements must observe every object the jobs create. Engine-made
    // pods always carry a job label, so no fallback cohort is named.
    let measurements = Measurements::start(
        &client,
        &uuid,
        "",
        &metadata,
        indexer.clone(),
        &spec.global.measurements,
    );

    let timed_out = Arc::new(AtomicBool::new(false));
    {
        let timed_out = timed_out.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            select! {
                _ = cancel.cancelled() => {}
                _ = sleep(timeout) => {
                    error!(?timeout, "run timeout expired, cancelling");
                    timed_out.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
            }
        });
    }

    let mut rc = codes::SUCCESS;
    let mut outcomes: Vec<JobOutcome> = Vec::new();
    for job in &spec.jobs {
        if cancel.is_cancelled() {
            warn!(job = job.name, "skipping job, run cancelled");
            break;
        }
        let fatal = job.fatal;
        let executor = JobExecutor::new(job.clone(), client.clone(), &uuid, cancel.clone());
        let outcome = executor.run().await;
        if let Some(indexer) = &indexer {
            let document = job_summary_doc(&outcome, &uuid, &metadata);
            let opts = IndexingOpts {
                metric_name: "jobSummary".to_owned(),
                job_name: outcome.name.clone(),
            };
            if let Err(err) = indexer.index(&[document], &opts).await {
                warn!(%err, "failed to index job summary");
            }
        }
        let state = outcome.state;
        outcomes.push(outcome);
        match state {
            JobState::Failed => {
                rc = codes::API;
                if fatal {
                    error!("fatal job failure, aborting remaining jobs");
                    break;
                }
            }
            JobState::Cancelled => {
                if rc == codes::SUCCESS {
                    rc = codes::GENERIC;
                }
                break;
            }
            _ => {}
        }
    }

    if let Err(err) = measurements.stop().await {
        error!(%err, "measurement subsystem failed");
        if rc == codes::SUCCESS {
            rc = codes::MEASUREMENT;
        }
    }
    let run_end = Utc::now();

    for target in &scrape_targets {
        for outcome in &outcomes {
            let scraped = prometheus::scrape(
                &target.client,
                &target.profile,
                &uuid,
                &outcome.name,
                outcome.start,
                outcome.end,
                &metadata,
                indexer.as_deref(),
            )
            .await;
            if let Err(err) = scraped {
                warn!(endpoint = target.client.endpoint(), %err, "dropping failed endpoint");
                break;
            }
        }
        if let Some(alerts) = &target.alerts {
            let critical = alerts
                .evaluate(&target.client, run_start, run_end, indexer.as_deref())
                .await;
            if critical && rc == codes::SUCCESS {
                rc = codes::ALERT_CRITICAL;
            }
        }
    }

    if let Some(indexer) = &indexer {
        if let Err(err) = indexer.close().await {
            error!(%err, "failed to close indexer");
        }
    }

    if timed_out.load(Ordering::SeqCst) {
        rc = codes::TIMEOUT;
    }
    info!(
        uuid,
        rc,
        elapsed = %(run_end - run_start),
        "run finished"
    );
    rc
}

/// Delete every namespace labeled with the UUID. Used by the destroy
/// subcommand and shares the run's label-scoped cleanup path.
pub async fn destroy(client: &Client, uuid: &str, timeout: Duration) -> Result<usize, kube::Error> {
    crate::job::namespaces::cleanup_namespaces(
        client,
        &uuid_selector(uuid),
        timeout,
        &CancellationToken::new(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_summary_document_shape() {
        let outcome = JobOutcome {
            name: "api-intensive".to_owned(),
            state: JobState::Completed,
            start: Utc::now(),
            end: Utc::now() + k8s_openapi::chrono::Duration::seconds(90),
            error: None,
            stats: None,
        };
        let metadata =
            BTreeMap::from_iter(vec![("platform".to_owned(), Value::from("baremetal"))]);
        let document = job_summary_doc(&outcome, "1f8e", &metadata);
        assert_eq!(document["jobName"], "api-intensive");
        assert_eq!(document["uuid"], "1f8e");
        assert_eq!(document["jobState"], "Completed");
        assert_eq!(document["metricName"], "jobSummary");
        assert_eq!(document["platform"], "baremetal");
        assert!(document["elapsedTime"].as_f64().unwrap() >= 90.0);
    }
}
