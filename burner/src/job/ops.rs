//! Delete, patch and read job execution.
//!
//! These job types bypass object rendering for expansion: they resolve a
//! selector and kind to the current object list, then pace one operation per
//! object through the dispatcher exactly like creates.
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use serde_json::Value;
use tokio::{select, time::sleep};
use tracing::{debug, info};

use super::{dynamic_api, JobError, JobExecutor, Post};
use crate::{
    config::{self, Object},
    dispatch::{Dispatcher, Submission},
    template::{self, RenderContext},
};

fn entry_coordinates(object: &Object) -> Result<(String, String), JobError> {
    let kind = object
        .kind
        .clone()
        .ok_or_else(|| JobError::Manifest("object entry without kind".to_owned()))?;
    let api_version = object.api_version.clone().unwrap_or_else(|| "v1".to_owned());
    Ok((api_version, kind))
}

async fn matching_objects(
    api: &Api<DynamicObject>,
    selector: &str,
) -> Result<Vec<(Option<String>, String)>, JobError> {
    let params = ListParams::default().labels(selector);
    let list = api.list_metadata(&params).await?;
    Ok(list
        .items
        .into_iter()
        .filter_map(|item| {
            item.metadata
                .name
                .clone()
                .map(|name| (item.metadata.namespace.clone(), name))
        })
        .collect())
}

/// Pace one deletion per object matching the selector.
pub(crate) async fn delete_matching(
    client: &Client,
    api_all: &Api<DynamicObject>,
    api_version: &str,
    kind: &str,
    selector: &str,
    dispatcher: &Dispatcher,
) -> Result<usize, JobError> {
    let objects = matching_objects(api_all, selector).await?;
    debug!(kind, selector, count = objects.len(), "deleting objects");
    for (namespace, name) in &objects {
        let api = dynamic_api(client, api_version, kind, namespace.as_deref());
        let object_name = name.clone();
        dispatcher
            .submit(Submission {
                name: format!("delete {kind} {name}"),
                op: Box::new(move || {
                    let api = api.clone();
                    let name = object_name.clone();
                    Box::pin(async move {
                        match api.delete(&name, &DeleteParams::default()).await {
                            Ok(_) => Ok(()),
                            Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
                            Err(err) => Err(err),
                        }
                    })
                }),
            })
            .await?;
    }
    Ok(objects.len())
}

/// Delete-type job: resolve each entry's selector and pace the deletions.
pub(crate) async fn delete(cx: &JobExecutor, dispatcher: &Dispatcher) -> Result<Post, JobError> {
    let mut waits = Vec::new();
    for object in &cx.job.objects {
        if cx.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let (api_version, kind) = entry_coordinates(object)?;
        let selector = object.selector();
        let api_all = dynamic_api(&cx.client, &api_version, &kind, None);
        let count =
            delete_matching(&cx.client, &api_all, &api_version, &kind, &selector, dispatcher)
                .await?;
        info!(job = cx.job.name, kind, selector, count, "deletions submitted");
        if cx.job.wait_for_deletion {
            waits.push((api_version, kind, selector));
        }
    }
    Ok(Post::Deleted { waits })
}

/// Patch-type job: apply the rendered payload as a merge patch to every
/// matching object, once per iteration.
pub(crate) async fn patch(cx: &JobExecutor, dispatcher: &Dispatcher) -> Result<Post, JobError> {
    let job = &cx.job;
    for iteration in 1..=job.job_iterations {
        for object in &job.objects {
            if cx.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let (api_version, kind) = entry_coordinates(object)?;
            let source = object.object_template.as_deref().ok_or_else(|| {
                JobError::Manifest("patch object without a template".to_owned())
            })?;
            let raw_template = config::read_to_string(source).await?;
            let context = RenderContext {
                uuid: &cx.uuid,
                job_name: &job.name,
                iteration,
                replica: 1,
                input_vars: &object.input_vars,
            };
            let payload = template::render(&raw_template, &context)?;
            let body: Value = serde_yaml::from_slice(&payload)
                .map_err(|err| JobError::Manifest(err.to_string()))?;

            let api_all = dynamic_api(&cx.client, &api_version, &kind, None);
            let objects = matching_objects(&api_all, &object.selector()).await?;
            debug!(job = job.name, kind, iteration, count = objects.len(), "patching objects");
            for (namespace, name) in objects {
                let api = dynamic_api(&cx.client, &api_version, &kind, namespace.as_deref());
                let body = body.clone();
                let object_name = name.clone();
                dispatcher
                    .submit(Submission {
                        name: format!("patch {kind} {name}"),
                        op: Box::new(move || {
                            let api = api.clone();
                            let name = object_name.clone();
                            let body = body.clone();
                            Box::pin(async move {
                                api.patch(&name, &PatchParams::default(), &Patch::Merge(body))
                                    .await
                                    .map(|_| ())
                            })
                        }),
                    })
                    .await?;
            }
        }
        if !job.job_pause.is_zero() {
            select! {
                _ = cx.cancel.cancelled() => return Err(JobError::Cancelled),
                _ = sleep(job.job_pause) => {}
            }
        }
    }
    Ok(Post::None)
}

/// Read-type job: pace one get per matching object, once per iteration.
pub(crate) async fn read(cx: &JobExecutor, dispatcher: &Dispatcher) -> Result<Post, JobError> {
    let job = &cx.job;
    for iteration in 1..=job.job_iterations {
        for object in &job.objects {
            if cx.cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let (api_version, kind) = entry_coordinates(object)?;
            let api_all = dynamic_api(&cx.client, &api_version, &kind, None);
            let objects = matching_objects(&api_all, &object.selector()).await?;
            debug!(job = job.name, kind, iteration, count = objects.len(), "reading objects");
            for (namespace, name) in objects {
                let api = dynamic_api(&cx.client, &api_version, &kind, namespace.as_deref());
                let object_name = name.clone();
                dispatcher
                    .submit(Submission {
                        name: format!("get {kind} {name}"),
                        op: Box::new(move || {
                            let api = api.clone();
                            let name = object_name.clone();
                            Box::pin(async move { api.get(&name).await.map(|_| ()) })
                        }),
                    })
                    .await?;
            }
        }
        if !job.job_pause.is_zero() {
            select! {
                _ = cx.cancel.cancelled() => return Err(JobError::Cancelled),
                _ = sleep(job.job_pause) => {}
            }
        }
    }
    Ok(Post::None)
}
