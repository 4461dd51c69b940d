//! Pod lifecycle latency measurement.
//!
//! A single watch on pods carrying the run-UUID label feeds per-shard
//! workers; each shard owns its record map so no event for a given pod is
//! ever processed concurrently with another. Stopping drains the shards,
//! derives per-phase latencies and quantiles, and emits documents.
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use futures::StreamExt;
use k8s_openapi::{
    api::core::v1::Pod,
    chrono::{DateTime, Utc},
};
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use kube_burner_common::labels::{uuid_selector, JOB_LABEL};
use serde::Serialize;
use serde_json::Value;
use tokio::{select, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MeasurementError;
use crate::indexers::{Indexer, IndexingOpts};

const SHARDS: usize = 8;
const PHASES: [&str; 4] = ["PodScheduled", "Initialized", "ContainersReady", "Ready"];

/// What one watch event tells us about a pod.
#[derive(Debug, Clone)]
pub(crate) struct PodSnapshot {
    uid: String,
    namespace: String,
    name: String,
    node: Option<String>,
    job: Option<String>,
    creation: Option<DateTime<Utc>>,
    /// Conditions currently True, with their transition times.
    conditions: Vec<(String, Option<DateTime<Utc>>)>,
    received: DateTime<Utc>,
}

/// Accumulated lifecycle timestamps for one pod.
#[derive(Debug, Default, Clone)]
pub(crate) struct PodRecord {
    namespace: String,
    name: String,
    node: Option<String>,
    job: Option<String>,
    creation: Option<DateTime<Utc>>,
    scheduled: Option<DateTime<Utc>>,
    initialized: Option<DateTime<Utc>>,
    containers_ready: Option<DateTime<Utc>>,
    ready: Option<DateTime<Utc>>,
}

impl PodRecord {
    fn phase_mut(&mut self, phase: &str) -> Option<&mut Option<DateTime<Utc>>> {
        match phase {
            "PodScheduled" => Some(&mut self.scheduled),
            "Initialized" => Some(&mut self.initialized),
            "ContainersReady" => Some(&mut self.containers_ready),
            "Ready" => Some(&mut self.ready),
            _ => None,
        }
    }

    fn complete(&self) -> bool {
        self.creation.is_some()
            && self.scheduled.is_some()
            && self.initialized.is_some()
            && self.containers_ready.is_some()
            && self.ready.is_some()
    }
}

pub(crate) fn snapshot_of(pod: &Pod, received: DateTime<Utc>) -> Option<PodSnapshot> {
    let uid = pod.metadata.uid.clone()?;
    let conditions = pod
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .filter(|c| c.status == "True")
                .map(|c| (c.type_.clone(), c.last_transition_time.as_ref().map(|t| t.0)))
                .collect()
        })
        .unwrap_or_default();
    Some(PodSnapshot {
        uid,
        namespace: pod.namespace().unwrap_or_default(),
        name: pod.name_any(),
        node: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
        job: pod.labels().get(JOB_LABEL).cloned(),
        creation: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        conditions,
        received,
    })
}

/// Fold one snapshot into the shard's record map.
///
/// Conditions already seen keep their first timestamp, so duplicate events
/// are no-ops.
pub(crate) fn apply_snapshot(records: &mut HashMap<String, PodRecord>, snapshot: PodSnapshot) {
    let record = records.entry(snapshot.uid).or_default();
    record.namespace = snapshot.namespace;
    record.name = snapshot.name;
    if record.node.is_none() {
        record.node = snapshot.node;
    }
    if record.job.is_none() {
        record.job = snapshot.job;
    }
    if record.creation.is_none() {
        record.creation = snapshot.creation;
    }
    for (condition, transition) in snapshot.conditions {
        if let Some(slot) = record.phase_mut(&condition) {
            if slot.is_none() {
                *slot = Some(transition.unwrap_or(snapshot.received));
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PodLatencyDocument {
    timestamp: String,
    pod_name: String,
    namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_name: Option<String>,
    job_name: String,
    uuid: String,
    metric_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduling_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initialized_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    containers_ready_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pod_ready_latency_ms: Option<i64>,
    incomplete: bool,
    #[serde(flatten)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuantileDocument {
    timestamp: String,
    quantile_name: String,
    job_name: String,
    uuid: String,
    metric_name: &'static str,
    count: usize,
    min: i64,
    max: i64,
    avg: i64,
    p50: i64,
    p95: i64,
    p99: i64,
    #[serde(flatten)]
    metadata: BTreeMap<String, Value>,
}

pub(crate) struct Summary {
    pub pod_documents: Vec<Value>,
    pub quantile_documents: Vec<Value>,
    pub complete: usize,
    pub incomplete: usize,
}

fn latency_ms(creation: DateTime<Utc>, phase: Option<DateTime<Utc>>) -> Option<i64> {
    phase.map(|t| (t - creation).num_milliseconds().max(0))
}

pub(crate) fn summarize(
    records: Vec<PodRecord>,
    uuid: &str,
    default_job: &str,
    metadata: &BTreeMap<String, Value>,
) -> Summary {
    let mut pod_documents = Vec::new();
    // (job, phase) -> latency samples from complete records
    let mut cohorts: BTreeMap<(String, &str), Vec<i64>> = BTreeMap::new();
    let mut complete = 0;
    let mut incomplete = 0;

    for record in records {
        let Some(creation) = record.creation else {
            warn!(pod = record.name, "pod observed without a creation timestamp");
            incomplete += 1;
            continue;
        };
        // Pods not created by a job, e.g. under stand-alone measuring, are
        // grouped under the caller's job name
        let job = record
            .job
            .clone()
            .unwrap_or_else(|| default_job.to_owned());
        let latencies = [
            latency_ms(creation, record.scheduled),
            latency_ms(creation, record.initialized),
            latency_ms(creation, record.containers_ready),
            latency_ms(creation, record.ready),
        ];
        let is_complete = record.complete();
        if is_complete {
            complete += 1;
            for (phase, latency) in PHASES.iter().copied().zip(latencies) {
                cohorts
                    .entry((job.clone(), phase))
                    .or_default()
                    .push(latency.unwrap_or(0));
            }
        } else {
            incomplete += 1;
        }
        let document = PodLatencyDocument {
            timestamp: creation.to_rfc3339(),
            pod_name: record.name,
            namespace: record.namespace,
            node_name: record.node,
            job_name: job,
            uuid: uuid.to_owned(),
            metric_name: "podLatencyMeasurement",
            scheduling_latency_ms: latencies[0],
            initialized_latency_ms: latencies[1],
            containers_ready_latency_ms: latencies[2],
            pod_ready_latency_ms: latencies[3],
            incomplete: !is_complete,
            metadata: metadata.clone(),
        };
        match serde_json::to_value(&document) {
            Ok(value) => pod_documents.push(value),
            Err(err) => error!(%err, "failed to encode pod latency document"),
        }
    }

    let now = Utc::now().to_rfc3339();
    let mut quantile_documents = Vec::new();
    for ((job, phase), mut samples) in cohorts {
        samples.sort_unstable();
        let count = samples.len();
        let sum: i64 = samples.iter().sum();
        let document = QuantileDocument {
            timestamp: now.clone(),
            quantile_name: phase.to_owned(),
            job_name: job,
            uuid: uuid.to_owned(),
            metric_name: "podLatencyQuantilesMeasurement",
            count,
            min: samples.first().copied().unwrap_or(0),
            max: samples.last().copied().unwrap_or(0),
            avg: if count > 0 { sum / count as i64 } else { 0 },
            p50: super::percentile(&samples, 50.0),
            p95: super::percentile(&samples, 95.0),
            p99: super::percentile(&samples, 99.0),
            metadata: metadata.clone(),
        };
        match serde_json::to_value(&document) {
            Ok(value) => quantile_documents.push(value),
            Err(err) => error!(%err, "failed to encode quantile document"),
        }
    }

    Summary {
        pod_documents,
        quantile_documents,
        complete,
        incomplete,
    }
}

/// Watch-driven pod latency measurement for one run.
pub struct PodLatency {
    cancel: CancellationToken,
    watch: JoinHandle<()>,
    shards: Vec<JoinHandle<HashMap<String, PodRecord>>>,
    uuid: String,
    default_job: String,
    metadata: BTreeMap<String, Value>,
    indexer: Option<Arc<Indexer>>,
}

impl PodLatency {
    /// Install the watch and start the shard workers.
    ///
    /// `default_job` names the cohort for pods without a job label.
    pub fn start(
        client: Client,
        uuid: &str,
        default_job: &str,
        metadata: BTreeMap<String, Value>,
        indexer: Option<Arc<Indexer>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut senders = Vec::with_capacity(SHARDS);
        let mut shards = Vec::with_capacity(SHARDS);
        for _ in 0..SHARDS {
            let (tx, mut rx) = mpsc::channel::<PodSnapshot>(256);
            senders.push(tx);
            shards.push(tokio::spawn(async move {
                let mut records = HashMap::new();
                while let Some(snapshot) = rx.recv().await {
                    apply_snapshot(&mut records, snapshot);
                }
                records
            }));
        }

        let api: Api<Pod> = Api::all(client);
        let selector = uuid_selector(uuid);
        let watch_cancel = cancel.clone();
        let watch = tokio::spawn(async move {
            let config = watcher::Config::default().labels(&selector);
            let mut stream = watcher(api, config)
                .default_backoff()
                .applied_objects()
                .boxed();
            loop {
                let event = select! {
                    _ = watch_cancel.cancelled() => break,
                    event = stream.next() => event,
                };
                match event {
                    Some(Ok(pod)) => {
                        let Some(snapshot) = snapshot_of(&pod, Utc::now()) else {
                            continue;
                        };
                        let mut hasher = DefaultHasher::new();
                        snapshot.uid.hash(&mut hasher);
                        let shard = (hasher.finish() as usize) % SHARDS;
                        if senders[shard].send(snapshot).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        // The watcher re-lists and resumes on its own
                        warn!(%err, "pod watch error, stream will recover");
                    }
                    None => {
                        error!("pod watch stream ended unexpectedly");
                        break;
                    }
                }
            }
        });

        info!(selector = uuid_selector(uuid), "started podLatency measurement");
        Self {
            cancel,
            watch,
            shards,
            uuid: uuid.to_owned(),
            default_job: default_job.to_owned(),
            metadata,
            indexer,
        }
    }

    /// Stop the watch, drain the shards and emit documents.
    pub async fn stop(self) -> Result<(), MeasurementError> {
        self.cancel.cancel();
        self.watch
            .await
            .map_err(|err| MeasurementError::WatchLost(err.to_string()))?;

        let mut records = Vec::new();
        for shard in self.shards {
            match shard.await {
                Ok(map) => records.extend(map.into_values()),
                Err(err) => return Err(MeasurementError::WatchLost(err.to_string())),
            }
        }

        let summary = summarize(records, &self.uuid, &self.default_job, &self.metadata);
        info!(
            complete = summary.complete,
            incomplete = summary.incomplete,
            "podLatency measurement finished"
        );
        if let Some(indexer) = self.indexer {
            for (documents, metric) in [
                (&summary.pod_documents, "podLatencyMeasurement"),
                (&summary.quantile_documents, "podLatencyQuantilesMeasurement"),
            ] {
                let opts = IndexingOpts {
                    metric_name: metric.to_owned(),
                    job_name: String::new(),
                };
                match indexer.index(documents, &opts).await {
                    Ok(outcome) => debug!(outcome, "indexed measurement documents"),
                    Err(err) => error!(%err, metric, "failed to index measurement documents"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{PodCondition, PodSpec, PodStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };
    use kube::core::ObjectMeta;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn snapshot(
        uid: &str,
        job: &str,
        creation: i64,
        conditions: &[(&str, i64)],
    ) -> PodSnapshot {
        PodSnapshot {
            uid: uid.to_owned(),
            namespace: "kube-burner-1".to_owned(),
            name: format!("pod-{uid}"),
            node: Some("node-a".to_owned()),
            job: Some(job.to_owned()),
            creation: Some(ts(creation)),
            conditions: conditions
                .iter()
                .map(|(phase, at)| (phase.to_string(), Some(ts(*at))))
                .collect(),
            received: ts(creation + 60),
        }
    }

    fn all_phases(at: i64) -> Vec<(&'static str, i64)> {
        vec![
            ("PodScheduled", at),
            ("Initialized", at),
            ("ContainersReady", at),
            ("Ready", at),
        ]
    }

    #[test]
    fn snapshots_fold_into_records() {
        let mut records = HashMap::new();
        apply_snapshot(
            &mut records,
            snapshot("a", "job", 0, &[("PodScheduled", 1)]),
        );
        apply_snapshot(
            &mut records,
            snapshot("a", "job", 0, &[("PodScheduled", 1), ("Ready", 5)]),
        );
        let record = &records["a"];
        assert_eq!(record.scheduled, Some(ts(1)));
        assert_eq!(record.ready, Some(ts(5)));
        assert!(!record.complete());
    }

    #[test]
    fn duplicate_conditions_keep_first_timestamp() {
        let mut records = HashMap::new();
        apply_snapshot(&mut records, snapshot("a", "job", 0, &[("Ready", 5)]));
        // A later event reporting a different transition time must not move it
        apply_snapshot(&mut records, snapshot("a", "job", 0, &[("Ready", 9)]));
        assert_eq!(records["a"].ready, Some(ts(5)));
    }

    #[test]
    fn missing_transition_time_falls_back_to_receipt() {
        let mut records = HashMap::new();
        let mut snap = snapshot("a", "job", 0, &[]);
        snap.conditions = vec![("Ready".to_owned(), None)];
        let received = snap.received;
        apply_snapshot(&mut records, snap);
        assert_eq!(records["a"].ready, Some(received));
    }

    #[test]
    fn summarize_computes_quantiles_per_phase() {
        let mut records = HashMap::new();
        for (uid, ready_at) in [("a", 100), ("b", 200), ("c", 300)] {
            apply_snapshot(&mut records, snapshot(uid, "api", 0, &all_phases(ready_at)));
        }
        let summary = summarize(records.into_values().collect(), "1f8e", "", &BTreeMap::new());
        assert_eq!(summary.complete, 3);
        assert_eq!(summary.incomplete, 0);
        assert_eq!(summary.pod_documents.len(), 3);
        // One quantile document per phase
        assert_eq!(summary.quantile_documents.len(), PHASES.len());

        let ready = summary
            .quantile_documents
            .iter()
            .find(|d| d["quantileName"] == "Ready")
            .unwrap();
        assert_eq!(ready["count"], 3);
        assert_eq!(ready["min"], 100_000);
        assert_eq!(ready["max"], 300_000);
        assert_eq!(ready["avg"], 200_000);
        assert_eq!(ready["p50"], 200_000);
        assert_eq!(ready["p99"], 300_000);
        assert_eq!(ready["uuid"], "1f8e");
        assert_eq!(ready["jobName"], "api");
        assert_eq!(ready["metricName"], "podLatencyQuantilesMeasurement");
    }

    #[test]
    fn incomplete_records_are_reported_but_excluded_from_quantiles() {
        let mut records = HashMap::new();
        apply_snapshot(&mut records, snapshot("a", "api", 0, &all_phases(10)));
        apply_snapshot(
            &mut records,
            snapshot("b", "api", 0, &[("PodScheduled", 5)]),
        );
        let summary = summarize(records.into_values().collect(), "1f8e", "", &BTreeMap::new());
        assert_eq!(summary.complete, 1);
        assert_eq!(summary.incomplete, 1);
        // Both pods get a document, only the complete one feeds quantiles
        assert_eq!(summary.pod_documents.len(), 2);
        let ready = summary
            .quantile_documents
            .iter()
            .find(|d| d["quantileName"] == "Ready")
            .unwrap();
        assert_eq!(ready["count"], 1);
        let stuck = summary
            .pod_documents
            .iter()
            .find(|d| d["podName"] == "pod-b")
            .unwrap();
        assert_eq!(stuck["incomplete"], true);
        assert!(stuck.get("podReadyLatencyMs").is_none());
    }

    #[test]
    fn quantiles_are_grouped_by_job() {
        let mut records = HashMap::new();
        apply_snapshot(&mut records, snapshot("a", "first", 0, &all_phases(10)));
        apply_snapshot(&mut records, snapshot("b", "second", 0, &all_phases(20)));
        let summary = summarize(records.into_values().collect(), "1f8e", "", &BTreeMap::new());
        assert_eq!(summary.quantile_documents.len(), 2 * PHASES.len());
    }

    #[test]
    fn unlabeled_pods_fall_back_to_the_default_job() {
        let mut records = HashMap::new();
        let mut unlabeled = snapshot("a", "ignored", 0, &all_phases(10));
        unlabeled.job = None;
        apply_snapshot(&mut records, unlabeled);
        let summary = summarize(
            records.into_values().collect(),
            "1f8e",
            "kube-burner-measure",
            &BTreeMap::new(),
        );
        assert_eq!(summary.pod_documents[0]["jobName"], "kube-burner-measure");
        assert_eq!(
            summary.quantile_documents[0]["jobName"],
            "kube-burner-measure"
        );
    }

    #[test]
    fn user_metadata_is_stamped_on_documents() {
        let mut records = HashMap::new();
        apply_snapshot(&mut records, snapshot("a", "api", 0, &all_phases(10)));
        let metadata =
            BTreeMap::from_iter(vec![("platform".to_owned(), Value::from("baremetal"))]);
        let summary = summarize(records.into_values().collect(), "1f8e", "", &metadata);
        assert_eq!(summary.pod_documents[0]["platform"], "baremetal");
        assert_eq!(summary.quantile_documents[0]["platform"], "baremetal");
    }

    #[test]
    fn snapshot_of_typed_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-1".to_owned()),
                namespace: Some("kube-burner-1".to_owned()),
                uid: Some("uid-1".to_owned()),
                creation_timestamp: Some(Time(ts(0))),
                labels: Some(BTreeMap::from_iter(vec![(
                    JOB_LABEL.to_owned(),
                    "api".to_owned(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_owned()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(vec![
                    PodCondition {
                        type_: "PodScheduled".to_owned(),
                        status: "True".to_owned(),
                        last_transition_time: Some(Time(ts(2))),
                        ..Default::default()
                    },
                    PodCondition {
                        type_: "Ready".to_owned(),
                        status: "False".to_owned(),
                        last_transition_time: Some(Time(ts(3))),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
        };
        let snapshot = snapshot_of(&pod, ts(60)).unwrap();
        assert_eq!(snapshot.uid, "uid-1");
        assert_eq!(snapshot.job.as_deref(), Some("api"));
        assert_eq!(snapshot.creation, Some(ts(0)));
        // Only conditions that are True are captured
        assert_eq!(snapshot.conditions.len(), 1);
        assert_eq!(snapshot.conditions[0].0, "PodScheduled");
    }

    #[test]
    fn pod_without_uid_is_ignored() {
        let pod = Pod::default();
        assert!(snapshot_of(&pod, ts(0)).is_none());
    }
}
