//! In-band measurements recording object lifecycle latencies during a run.
use std::{collections::BTreeMap, sync::Arc};

use kube::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{config::Measurement, indexers::Indexer};

pub mod pod_latency;

pub use pod_latency::PodLatency;

/// Errors produced by the measurement subsystem.
#[derive(Debug, Error)]
pub enum MeasurementError {
    /// The watch connection was lost and could not be re-established.
    #[error("measurement watch lost: {0}")]
    WatchLost(String),
}

/// The measurements configured for a run.
///
/// Started before the first job and stopped after the last one; stopping
/// finalizes aggregates and emits documents for whatever was observed.
pub struct Measurements {
    pod_latency: Option<PodLatency>,
}

impl Measurements {
    /// Instantiate every configured measurement.
    ///
    /// `default_job_name` labels cohorts of observed objects that carry no
    /// job label, as under stand-alone measuring.
    pub fn start(
        client: &Client,
        uuid: &str,
        default_job_name: &str,
        metadata: &BTreeMap<String, Value>,
        indexer: Option<Arc<Indexer>>,
        configured: &[Measurement],
    ) -> Self {
        let mut pod_latency = None;
        for measurement in configured {
            match measurement.name.as_str() {
                "podLatency" => {
                    pod_latency = Some(PodLatency::start(
                        client.clone(),
                        uuid,
                        default_job_name,
                        metadata.clone(),
                        indexer.clone(),
                    ));
                }
                other => warn!(measurement = other, "unknown measurement, skipping"),
            }
        }
        Self { pod_latency }
    }

    /// Whether any measurement is active.
    pub fn is_active(&self) -> bool {
        self.pod_latency.is_some()
    }

    /// Stop all measurements, emit their documents and report failures.
    pub async fn stop(self) -> Result<(), MeasurementError> {
        if let Some(pod_latency) = self.pod_latency {
            pod_latency.stop().await?;
        }
        Ok(())
    }
}

/// Exact percentile over a sorted sample using the nearest-rank method.
pub(crate) fn percentile(sorted: &[i64], pct: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_nearest_rank() {
        let sample = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile(&sample, 50.0), 50);
        assert_eq!(percentile(&sample, 95.0), 100);
        assert_eq!(percentile(&sample, 99.0), 100);
        assert_eq!(percentile(&sample, 100.0), 100);
    }

    #[test]
    fn percentile_of_singleton_and_empty() {
        assert_eq!(percentile(&[42], 50.0), 42);
        assert_eq!(percentile(&[42], 99.0), 42);
        assert_eq!(percentile(&[], 99.0), 0);
    }
}
