//! Provides types and functions common to the kube-burner engine and tooling.
#![deny(missing_docs)]
pub mod labels;
pub mod telemetry;
