//! Create-type job execution.
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::{
    apps::v1::{DaemonSet, DaemonSetSpec},
    core::v1::{Container, PodSpec, PodTemplateSpec},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, PostParams},
    core::{DynamicObject, ObjectMeta},
};
use kube_burner_common::labels::fingerprint_labels_extend;
use serde_json::Value;
use tokio::{select, time::sleep};
use tracing::{debug, info, warn};

use super::{dynamic_api, namespaces, JobError, JobExecutor, Post, TrackedObject};
use crate::{
    config,
    dispatch::{Dispatcher, Submission},
    template::{self, RenderContext},
};

const PRELOAD_NAMESPACE: &str = "preload-kube-burner";

/// Expand the job's iterations into paced create submissions.
pub(crate) async fn execute(
    cx: &JobExecutor,
    dispatcher: &Dispatcher,
    kinds: &mut BTreeSet<(String, String)>,
) -> Result<Post, JobError> {
    let job = &cx.job;
    let mut templates = Vec::with_capacity(job.objects.len());
    for object in &job.objects {
        let source = object.object_template.as_deref().ok_or_else(|| {
            JobError::Manifest(format!("job {} object without a template", job.name))
        })?;
        templates.push(config::read_to_string(source).await?);
    }

    if job.pre_load_images {
        preload_images(cx, &templates).await?;
    }

    namespaces::prepare(&cx.client, &cx.uuid, job).await?;

    let mut tracked = Vec::new();
    let mut expected: BTreeMap<(String, String), usize> = BTreeMap::new();
    for iteration in 1..=job.job_iterations {
        if cx.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let namespace = job.namespace_for(iteration);
        let mut iteration_objects = Vec::new();
        for (object, raw_template) in job.objects.iter().zip(&templates) {
            for replica in 1..=object.replicas {
                let context = RenderContext {
                    uuid: &cx.uuid,
                    job_name: &job.name,
                    iteration,
                    replica,
                    input_vars: &object.input_vars,
                };
                let payload = template::render(raw_template, &context)?;
                let mut manifest: DynamicObject = serde_yaml::from_slice(&payload)
                    .map_err(|err| JobError::Manifest(err.to_string()))?;
                let types = manifest
                    .types
                    .clone()
                    .ok_or_else(|| JobError::Manifest("missing apiVersion or kind".to_owned()))?;
                let name = manifest
                    .metadata
                    .name
                    .clone()
                    .ok_or_else(|| JobError::Manifest("missing metadata.name".to_owned()))?;
                manifest.metadata.namespace = Some(namespace.clone());
                manifest.metadata.labels = Some(fingerprint_labels_extend(
                    manifest.metadata.labels.take().unwrap_or_default(),
                    &cx.uuid,
                    &job.name,
                    iteration,
                ));

                let api = dynamic_api(&cx.client, &types.api_version, &types.kind, Some(&namespace));
                let submission_manifest = manifest.clone();
                dispatcher
                    .submit(Submission {
                        name: format!("create {} {namespace}/{name}", types.kind),
                        op: Box::new(move || {
                            let api = api.clone();
                            let manifest = submission_manifest.clone();
                            Box::pin(async move {
                                api.create(&PostParams::default(), &manifest)
                                    .await
                                    .map(|_| ())
                            })
                        }),
                    })
                    .await?;

                kinds.insert((types.api_version.clone(), types.kind.clone()));
                *expected
                    .entry((types.api_version.clone(), types.kind.clone()))
                    .or_default() += 1;
                iteration_objects.push(TrackedObject {
                    api_version: types.api_version,
                    kind: types.kind,
                    namespace: namespace.clone(),
                    name,
                    wait_options: object.wait_options.clone(),
                });
            }
        }
        if job.pod_wait {
            debug!(job = job.name, iteration, "waiting for iteration objects");
            dispatcher.barrier().await;
            cx.wait_tracked(&iteration_objects).await?;
        }
        tracked.extend(iteration_objects);
        if !job.job_pause.is_zero() {
            select! {
                _ = cx.cancel.cancelled() => return Err(JobError::Cancelled),
                _ = sleep(job.job_pause) => {}
            }
        }
    }
    Ok(Post::Created { tracked, expected })
}

/// Collect container images referenced by a manifest.
fn collect_images(value: &Value, images: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "containers" || key == "initContainers" {
                    if let Value::Array(containers) = child {
                        for container in containers {
                            if let Some(image) = container["image"].as_str() {
                                images.insert(image.to_owned());
                            }
                        }
                    }
                }
                collect_images(child, images);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_images(item, images);
            }
        }
        _ => {}
    }
}

/// Pre-pull every referenced image onto every node with a short-lived
/// daemonset, then tear it down.
async fn preload_images(cx: &JobExecutor, templates: &[String]) -> Result<(), JobError> {
    let job = &cx.job;
    let mut images = BTreeSet::new();
    for (object, raw_template) in job.objects.iter().zip(templates) {
        let context = RenderContext {
            uuid: &cx.uuid,
            job_name: &job.name,
            iteration: 1,
            replica: 1,
            input_vars: &object.input_vars,
        };
        let payload = template::render(raw_template, &context)?;
        let manifest: Value = serde_yaml::from_slice(&payload)
            .map_err(|err| JobError::Manifest(err.to_string()))?;
        collect_images(&manifest, &mut images);
    }
    if images.is_empty() {
        warn!(job = job.name, "preload requested but no images found");
        return Ok(());
    }
    info!(job = job.name, count = images.len(), "preloading images");

    namespaces::create_namespace(
        &cx.client,
        PRELOAD_NAMESPACE,
        fingerprint_labels_extend(BTreeMap::new(), &cx.uuid, &job.name, 0),
    )
    .await?;

    let selector = BTreeMap::from_iter(vec![("app".to_owned(), "preload".to_owned())]);
    let daemon_set = DaemonSet {
        metadata: ObjectMeta {
            name: Some("preload".to_owned()),
            labels: Some(fingerprint_labels_extend(
                BTreeMap::new(),
                &cx.uuid,
                &job.name,
                0,
            )),
            ..ObjectMeta::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: images
                        .iter()
                        .enumerate()
                        .map(|(i, image)| Container {
                            name: format!("preload-{i}"),
                            image: Some(image.clone()),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    let api: Api<DaemonSet> = Api::namespaced(cx.client.clone(), PRELOAD_NAMESPACE);
    api.create(&PostParams::default(), &daemon_set).await?;

    select! {
        _ = cx.cancel.cancelled() => {}
        _ = sleep(job.pre_load_period) => {}
    }
    namespaces::delete_namespace(&cx.client, PRELOAD_NAMESPACE).await?;
    if cx.cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_images_from_pod_bearing_manifests() {
        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "spec": {
                "template": {
                    "spec": {
                        "initContainers": [{"name": "setup", "image": "quay.io/test/init:1"}],
                        "containers": [
                            {"name": "app", "image": "quay.io/test/app:2"},
                            {"name": "sidecar", "image": "quay.io/test/sidecar:3"}
                        ]
                    }
                }
            }
        });
        let mut images = BTreeSet::new();
        collect_images(&deployment, &mut images);
        assert_eq!(
            images.into_iter().collect::<Vec<_>>(),
            vec![
                "quay.io/test/app:2",
                "quay.io/test/init:1",
                "quay.io/test/sidecar:3"
            ]
        );
    }

    #[test]
    fn manifests_without_pods_yield_no_images() {
        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "spec": {"ports": [{"port": 80}]}
        });
        let mut images = BTreeSet::new();
        collect_images(&service, &mut images);
        assert!(images.is_empty());
    }
}
