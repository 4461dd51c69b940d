//! Namespace lifecycle for jobs.
use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::ObjectMeta,
    Client, ResourceExt,
};
use kube_burner_common::labels::fingerprint_labels_extend;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Job;

/// Create a namespace, tolerating that it already exists.
pub async fn create_namespace(
    client: &Client,
    name: &str,
    labels: BTreeMap<String, String>,
) -> Result<(), kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        ..Default::default()
    };
    match namespaces.create(&PostParams::default(), &namespace).await {
        Ok(_) => {
            debug!(namespace = name, "created namespace");
            Ok(())
        }
        Err(kube::Error::Api(err)) if err.reason == "AlreadyExists" => {
            debug!(namespace = name, "namespace already exists");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Pre-create every namespace a job will use, stamped with the fingerprint
/// labels plus the job's own namespace labels.
pub async fn prepare(client: &Client, uuid: &str, job: &Job) -> Result<(), kube::Error> {
    let iterations = if job.namespaced_iterations {
        (1..=job.job_iterations).collect::<Vec<_>>()
    } else if job.job_iterations > 0 {
        vec![1]
    } else {
        Vec::new()
    };
    for iteration in iterations {
        let name = job.namespace_for(iteration);
        let labels = fingerprint_labels_extend(
            job.namespace_labels.clone(),
            uuid,
            &job.name,
            iteration,
        );
        create_namespace(client, &name, labels).await?;
    }
    Ok(())
}

/// Delete a single namespace, tolerating that it is already gone.
pub async fn delete_namespace(client: &Client, name: &str) -> Result<(), kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    match namespaces.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(err) => Err(err),
    }
}

/// Delete every namespace matching the selector and wait until they are gone.
///
/// Returns the number of namespaces that were deleted. Waiting respects the
/// timeout and the cancellation token; on expiry the remaining namespaces
/// are left terminating.
pub async fn cleanup_namespaces(
    client: &Client,
    selector: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<usize, kube::Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let params = ListParams::default().labels(selector);
    let found = namespaces.list_metadata(&params).await?;
    if found.items.is_empty() {
        return Ok(0);
    }
    info!(selector, count = found.items.len(), "deleting namespaces");
    for namespace in &found.items {
        delete_namespace(client, &namespace.name_any()).await?;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = namespaces.list_metadata(&params).await?.items.len();
        if remaining == 0 {
            return Ok(found.items.len());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(selector, remaining, "namespaces still terminating at timeout");
            return Ok(found.items.len() - remaining);
        }
        debug!(selector, remaining, "waiting for namespace deletion");
        select! {
            _ = cancel.cancelled() => {
                warn!(selector, remaining, "namespace wait cancelled");
                return Ok(found.items.len() - remaining);
            }
            _ = sleep(Duration::from_secs(2)) => {}
        }
    }
}
