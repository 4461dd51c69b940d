//! Engine for stressing a Kubernetes cluster with controlled workloads of
//! object creations, mutations and deletions, while measuring control-plane
//! latencies and collecting Prometheus metrics over the run window.
#![deny(missing_docs)]

pub mod alerting;
pub mod config;
pub mod dispatch;
pub mod indexers;
pub mod job;
pub mod measurements;
pub mod prometheus;
pub mod run;
pub mod template;
pub mod wait;
