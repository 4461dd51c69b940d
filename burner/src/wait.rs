//! Watches created objects until they reach a readiness condition.
//!
//! Readiness predicates are keyed on the object's kind and may be overridden
//! per object entry with a condition type. Waits ride a watch stream rather
//! than polling, so they add no meaningful API load while the dispatcher is
//! saturating the server.
use std::time::Duration;

use kube::{
    api::{Api, ListParams},
    core::DynamicObject,
    runtime::wait::await_condition,
};
use serde_json::Value;
use thiserror::Error;
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::WaitOptions;

/// Errors produced while waiting on object readiness.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Readiness was not reached within the bound.
    #[error("{kind} {name} not ready after {timeout:?}")]
    Timeout {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// The wait bound that elapsed.
        timeout: Duration,
    },
    /// The watch stream failed.
    #[error("watch failed for {kind} {name}: {reason}")]
    Watch {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// Underlying failure.
        reason: String,
    },
    /// The run was cancelled mid-wait.
    #[error("wait cancelled")]
    Cancelled,
}

/// A readiness predicate over an observed object.
pub type ReadyPredicate = Box<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// Build the readiness predicate for a kind, honoring per-object overrides.
pub fn ready_predicate(kind: &str, opts: &WaitOptions) -> ReadyPredicate {
    if let Some(condition) = opts.for_condition.clone() {
        return Box::new(move |obj| condition_true(obj, &condition));
    }
    match kind {
        "Pod" => Box::new(|obj| condition_true(obj, "Ready")),
        "Deployment" | "ReplicaSet" | "StatefulSet" | "ReplicationController" => {
            Box::new(|obj| {
                let desired = int_at(obj, &["spec", "replicas"]).unwrap_or(1);
                int_at(obj, &["status", "readyReplicas"]).unwrap_or(0) >= desired
            })
        }
        "DaemonSet" => Box::new(|obj| {
            let desired = int_at(obj, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            desired > 0 && int_at(obj, &["status", "numberReady"]).unwrap_or(0) >= desired
        }),
        "Job" => Box::new(|obj| {
            let completions = int_at(obj, &["spec", "completions"]).unwrap_or(1);
            int_at(obj, &["status", "succeeded"]).unwrap_or(0) >= completions
        }),
        "Namespace" | "Service" | "ConfigMap" | "Secret" => Box::new(|_| true),
        // Unknown kinds are considered ready on creation unless the object
        // entry names a condition to wait for
        other => {
            debug!(kind = other, "no readiness predicate for kind, not waiting");
            Box::new(|_| true)
        }
    }
}

/// Whether a status condition of the given type is True.
fn condition_true(obj: &DynamicObject, condition: &str) -> bool {
    obj.data["status"]["conditions"]
        .as_array()
        .map(|conditions| {
            conditions.iter().any(|c| {
                c["type"].as_str() == Some(condition) && c["status"].as_str() == Some("True")
            })
        })
        .unwrap_or(false)
}

fn int_at(obj: &DynamicObject, path: &[&str]) -> Option<i64> {
    let mut value: &Value = &obj.data;
    for key in path {
        value = &value[key];
    }
    value.as_i64()
}

/// Wait until the object satisfies the predicate, the timeout elapses, or the
/// run is cancelled.
///
/// A zero timeout skips the wait entirely.
pub async fn wait_ready(
    api: Api<DynamicObject>,
    kind: &str,
    name: &str,
    predicate: ReadyPredicate,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    if timeout.is_zero() {
        return Ok(());
    }
    let condition = move |obj: Option<&DynamicObject>| obj.map(|obj| predicate(obj)).unwrap_or(false);
    let wait = await_condition(api, name, condition);
    select! {
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        outcome = tokio::time::timeout(timeout, wait) => match outcome {
            Err(_) => Err(WaitError::Timeout {
                kind: kind.to_owned(),
                name: name.to_owned(),
                timeout,
            }),
            Ok(Err(err)) => Err(WaitError::Watch {
                kind: kind.to_owned(),
                name: name.to_owned(),
                reason: err.to_string(),
            }),
            Ok(Ok(_)) => Ok(()),
        },
    }
}

/// Block until a list with the selector comes back empty.
///
/// Deletion has no single object to watch, so this is a bounded poll.
pub async fn wait_for_deletion(
    api: Api<DynamicObject>,
    selector: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    if timeout.is_zero() {
        return Ok(());
    }
    let deadline = tokio::time::Instant::now() + timeout;
    let params = ListParams::default().labels(selector);
    loop {
        let remaining = match api.list_metadata(&params).await {
            Ok(list) => list.items.len(),
            Err(err) => {
                return Err(WaitError::Watch {
                    kind: "list".to_owned(),
                    name: selector.to_owned(),
                    reason: err.to_string(),
                })
            }
        };
        if remaining == 0 {
            return Ok(());
        }
        debug!(selector, remaining, "objects still present");
        if tokio::time::Instant::now() >= deadline {
            return Err(WaitError::Timeout {
                kind: "selector".to_owned(),
                name: selector.to_owned(),
                timeout,
            });
        }
        select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = sleep(Duration::from_secs(2)) => {}
        }
    }
}
