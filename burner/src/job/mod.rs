//! Job execution.
//!
//! A job expands into concrete API operations which flow through a paced
//! dispatcher. Jobs run strictly sequentially within a run; inside a job,
//! iterations are submitted in index order and replicas in declared template
//! order. Completion order is up to the API server.
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::chrono::{DateTime, Utc};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use kube_burner_common::labels::job_selector;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{Job, JobType, WaitOptions},
    dispatch::{DispatchError, DispatchStats, Dispatcher},
    template::TemplateError,
    wait::{self, WaitError},
};

pub mod create;
pub mod namespaces;
pub mod ops;

/// Errors produced while executing a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// A template could not be rendered.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// A rendered payload is not a usable manifest.
    #[error("invalid manifest: {0}")]
    Manifest(String),
    /// A template source could not be read.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// A direct API operation failed.
    #[error("api error: {0}")]
    Api(#[from] kube::Error),
    /// A readiness wait failed.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// The dispatcher rejected a submission.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// Final object counts did not match the declared amount.
    #[error("verification failed for {kind}: expected {expected} objects, found {found}")]
    Verification {
        /// Verified kind.
        kind: String,
        /// Declared object count.
        expected: usize,
        /// Objects found on the API.
        found: usize,
    },
    /// The run was cancelled while the job was active.
    #[error("job cancelled")]
    Cancelled,
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Declared but not started.
    Pending,
    /// Submitting operations.
    Running,
    /// Blocking on readiness or deletion.
    Waiting,
    /// Finished successfully.
    Completed,
    /// Finished with an unrecovered error.
    Failed,
    /// Interrupted by run cancellation.
    Cancelled,
}

impl JobState {
    /// Name as emitted into summary documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Running => "Running",
            JobState::Waiting => "Waiting",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        }
    }
}

/// One object created by a job, remembered for waits and verification.
#[derive(Debug, Clone)]
pub struct TrackedObject {
    /// apiVersion of the object.
    pub api_version: String,
    /// Kind of the object.
    pub kind: String,
    /// Namespace the object lives in.
    pub namespace: String,
    /// Object name.
    pub name: String,
    /// Readiness overrides from the object entry.
    pub wait_options: WaitOptions,
}

/// Work left to do after all submissions of a job have executed.
pub(crate) enum Post {
    /// Created objects to wait on and verify.
    Created {
        tracked: Vec<TrackedObject>,
        expected: BTreeMap<(String, String), usize>,
    },
    /// Selectors to confirm deletion of.
    Deleted {
        waits: Vec<(String, String, String)>,
    },
    /// Nothing left.
    None,
}

/// Result of one job execution.
#[derive(Debug)]
pub struct JobOutcome {
    /// Job name.
    pub name: String,
    /// Terminal state.
    pub state: JobState,
    /// When the job started.
    pub start: DateTime<Utc>,
    /// When the job resolved.
    pub end: DateTime<Utc>,
    /// Error detail for failed jobs.
    pub error: Option<String>,
    /// Dispatcher counters and API latency digest.
    pub stats: Option<DispatchStats>,
}

/// Build a dynamic Api for an (apiVersion, kind) pair.
pub(crate) fn dynamic_api(
    client: &Client,
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    let gvk = GroupVersionKind::gvk(group, version, kind);
    let resource = ApiResource::from_gvk(&gvk);
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
        None => Api::all_with(client.clone(), &resource),
    }
}

/// Executes one job of the run.
pub struct JobExecutor {
    pub(crate) job: Job,
    pub(crate) client: Client,
    pub(crate) uuid: String,
    pub(crate) cancel: CancellationToken,
}

impl JobExecutor {
    /// Executor for one job.
    pub fn new(job: Job, client: Client, uuid: &str, cancel: CancellationToken) -> Self {
        Self {
            job,
            client,
            uuid: uuid.to_owned(),
            cancel,
        }
    }

    fn transition(&self, from: JobState, to: JobState) {
        info!(
            job = self.job.name,
            from = from.as_str(),
            to = to.as_str(),
            at = %Utc::now().to_rfc3339(),
            "job transition"
        );
    }

    /// Run the job to a terminal state.
    pub async fn run(&self) -> JobOutcome {
        let start = Utc::now();
        self.transition(JobState::Pending, JobState::Running);
        let dispatcher = Dispatcher::new(
            self.job.qps,
            self.job.burst,
            self.job.workers,
            self.job.retry,
            self.cancel.child_token(),
        );

        let mut kinds: BTreeSet<(String, String)> = BTreeSet::new();
        let result = match self.job.job_type {
            JobType::Create => create::execute(self, &dispatcher, &mut kinds).await,
            JobType::Delete => ops::delete(self, &dispatcher).await,
            JobType::Patch => ops::patch(self, &dispatcher).await,
            JobType::Read => ops::read(self, &dispatcher).await,
        };

        // Fence every submission before post phases look at the cluster
        dispatcher.barrier().await;
        let result = match result {
            Ok(post) => self.post_phase(post).await,
            Err(err) => Err(err),
        };
        let stats = dispatcher.drain().await;
        info!(
            job = self.job.name,
            succeeded = stats.succeeded,
            failed = stats.failed,
            p50 = format!("{:.3}s", stats.quantile(0.5)),
            p99 = format!("{:.3}s", stats.quantile(0.99)),
            "job dispatch finished"
        );

        let state = match &result {
            Ok(()) if self.cancel.is_cancelled() => JobState::Cancelled,
            Ok(()) => JobState::Completed,
            Err(JobError::Cancelled) | Err(JobError::Wait(WaitError::Cancelled)) => {
                JobState::Cancelled
            }
            Err(_) => JobState::Failed,
        };
        let error = result.err().map(|err| err.to_string());
        if let Some(error) = &error {
            error!(job = self.job.name, error, "job failed");
        }

        // Cleanup always runs best-effort, also on failure
        if self.job.cleanup {
            if let Err(err) = self.cleanup(&kinds).await {
                warn!(job = self.job.name, %err, "cleanup failed");
            }
        }

        self.transition(JobState::Running, state);
        JobOutcome {
            name: self.job.name.clone(),
            state,
            start,
            end: Utc::now(),
            error,
            stats: Some(stats),
        }
    }

    async fn post_phase(&self, post: Post) -> Result<(), JobError> {
        match post {
            Post::Created { tracked, expected } => {
                if self.job.wait_when_finished && !self.job.pod_wait {
                    self.transition(JobState::Running, JobState::Waiting);
                    self.wait_tracked(&tracked).await?;
                }
                if self.job.verify_objects {
                    self.verify(&expected).await?;
                }
                Ok(())
            }
            Post::Deleted { waits } => {
                if self.job.wait_for_deletion {
                    self.transition(JobState::Running, JobState::Waiting);
                    for (api_version, kind, selector) in waits {
                        let api = dynamic_api(&self.client, &api_version, &kind, None);
                        wait::wait_for_deletion(
                            api,
                            &selector,
                            self.job.max_wait_timeout,
                            &self.cancel,
                        )
                        .await?;
                    }
                }
                Ok(())
            }
            Post::None => Ok(()),
        }
    }

    /// Wait for every tracked object to become ready.
    pub(crate) async fn wait_tracked(&self, tracked: &[TrackedObject]) -> Result<(), JobError> {
        for object in tracked {
            let api = dynamic_api(
                &self.client,
                &object.api_version,
                &object.kind,
                Some(&object.namespace),
            );
            let predicate = wait::ready_predicate(&object.kind, &object.wait_options);
            let waited = wait::wait_ready(
                api,
                &object.kind,
                &object.name,
                predicate,
                self.job.max_wait_timeout,
                &self.cancel,
            )
            .await;
            match waited {
                Ok(()) => {}
                Err(WaitError::Cancelled) => return Err(JobError::Cancelled),
                Err(err) if self.job.error_on_verify => return Err(err.into()),
                Err(err) => warn!(job = self.job.name, %err, "readiness wait failed"),
            }
        }
        Ok(())
    }

    async fn verify(&self, expected: &BTreeMap<(String, String), usize>) -> Result<(), JobError> {
        let selector = job_selector(&self.uuid, &self.job.name);
        for ((api_version, kind), count) in expected {
            let api = dynamic_api(&self.client, api_version, kind, None);
            let found = api
                .list_metadata(&ListParams::default().labels(&selector))
                .await?
                .items
                .len();
            if found != *count {
                let mismatch = JobError::Verification {
                    kind: kind.clone(),
                    expected: *count,
                    found,
                };
                if self.job.error_on_verify {
                    return Err(mismatch);
                }
                error!(job = self.job.name, %mismatch, "object verification failed");
            } else {
                info!(job = self.job.name, kind, found, "object verification passed");
            }
        }
        Ok(())
    }

    /// Delete everything this job created, label-scoped and paced.
    pub(crate) async fn cleanup(&self, kinds: &BTreeSet<(String, String)>) -> Result<(), JobError> {
        let selector = job_selector(&self.uuid, &self.job.name);
        info!(job = self.job.name, selector, "cleaning up job objects");
        // Cleanup gets its own pacing so a failed dispatcher does not block it
        let dispatcher = Dispatcher::new(
            self.job.qps,
            self.job.burst,
            self.job.workers,
            self.job.retry,
            self.cancel.child_token(),
        );
        for (api_version, kind) in kinds {
            let api = dynamic_api(&self.client, api_version, kind, None);
            ops::delete_matching(&self.client, &api, api_version, kind, &selector, &dispatcher)
                .await?;
        }
        dispatcher.barrier().await;
        drop(dispatcher.drain().await);
        namespaces::cleanup_namespaces(
            &self.client,
            &selector,
            self.job.max_wait_timeout,
            &self.cancel,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{body::to_bytes, Body};
    use serde_json::{json, Value};
    use std::io::Write;

    type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;

    // Build a test executor backed by a mocked apiserver
    fn mock_executor(job: Job) -> (JobExecutor, ApiServerHandle) {
        let (mock_service, handle) =
            tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
        let client = Client::new(mock_service, "default");
        let executor = JobExecutor::new(job, client, "1f8e", CancellationToken::new());
        (executor, handle)
    }

    async fn next_request(
        handle: &mut ApiServerHandle,
    ) -> (
        String,
        String,
        Value,
        tower_test::mock::SendResponse<http::Response<Body>>,
    ) {
        let (request, send) = handle
            .next_request()
            .await
            .expect("apiserver should be called");
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let bytes = to_bytes(request.into_body())
            .await
            .expect("body should be readable");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("body should be JSON")
        };
        (method, uri, body, send)
    }

    fn respond(send: tower_test::mock::SendResponse<http::Response<Body>>, body: Value) {
        send.send_response(
            http::Response::builder()
                .body(Body::from(body.to_string()))
                .expect("response should build"),
        );
    }

    async fn timeout_after_1s(
        handle: tokio::task::JoinHandle<JobOutcome>,
    ) -> JobOutcome {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("executor should not panic")
    }

    fn create_job(template_path: &str) -> Job {
        let raw = format!(
            r#"
jobs:
  - name: mock-job
    jobIterations: 2
    workers: 1
    cleanup: false
    waitWhenFinished: false
    verifyObjects: false
    objects:
      - objectTemplate: {template_path}
"#
        );
        crate::config::parse("1f8e", &raw).unwrap().jobs.remove(0)
    }

    #[tokio::test]
    async fn create_job_stamps_fingerprint_labels() {
        let mut template = tempfile::NamedTempFile::new().unwrap();
        write!(
            template,
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-{{{{ Iteration }}}}\ndata:\n  owner: {{{{ JobName }}}}\n"
        )
        .unwrap();
        let (executor, mut handle) =
            mock_executor(create_job(template.path().to_str().unwrap()));
        let run = tokio::spawn(async move { executor.run().await });

        // Shared namespace is created first, carrying the fingerprint labels
        let (method, uri, body, send) = next_request(&mut handle).await;
        assert_eq!(method, "POST");
        assert!(uri.starts_with("/api/v1/namespaces"), "uri was {uri}");
        assert_eq!(body["metadata"]["name"], "mock-job");
        assert_eq!(body["metadata"]["labels"]["kube-burner-uuid"], "1f8e");
        assert_eq!(body["metadata"]["labels"]["kube-burner-job"], "mock-job");
        respond(
            send,
            json!({"kind": "Namespace", "apiVersion": "v1", "metadata": {"name": "mock-job"}}),
        );

        // One create per iteration, in index order
        for iteration in 1..=2 {
            let (method, uri, body, send) = next_request(&mut handle).await;
            assert_eq!(method, "POST");
            assert!(
                uri.starts_with("/api/v1/namespaces/mock-job/configmaps"),
                "uri was {uri}"
            );
            assert_eq!(body["metadata"]["name"], format!("cm-{iteration}"));
            assert_eq!(body["metadata"]["namespace"], "mock-job");
            assert_eq!(body["metadata"]["labels"]["kube-burner-uuid"], "1f8e");
            assert_eq!(body["metadata"]["labels"]["kube-burner-job"], "mock-job");
            assert_eq!(
                body["metadata"]["labels"]["kube-burner-index"],
                iteration.to_string()
            );
            assert_eq!(body["data"]["owner"], "mock-job");
            let echo = body.clone();
            respond(send, echo);
        }

        let outcome = timeout_after_1s(run).await;
        assert_eq!(outcome.state, JobState::Completed);
        let stats = outcome.stats.unwrap();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn zero_iteration_job_is_a_noop() {
        let mut template = tempfile::NamedTempFile::new().unwrap();
        write!(template, "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n").unwrap();
        let mut job = create_job(template.path().to_str().unwrap());
        job.job_iterations = 0;
        let (executor, mut handle) = mock_executor(job);
        let run = tokio::spawn(async move { executor.run().await });
        // No namespace, no objects: the apiserver must never be called
        let outcome = timeout_after_1s(run).await;
        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.stats.unwrap().succeeded, 0);
        drop(handle);
    }

    #[test]
    fn api_resources_split_group_and_version() {
        let apps = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        assert_eq!(apps.plural, "deployments");
        assert_eq!(apps.api_version, "apps/v1");
        let core = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        assert_eq!(core.plural, "configmaps");
        assert_eq!(core.api_version, "v1");
    }
}

