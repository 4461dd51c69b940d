//! Fingerprint labels identifying objects created by a run.
//!
//! Labels are the sole identity of a run: cleanup and selection are always
//! scoped by them, never by names or timestamps.
use std::collections::BTreeMap;

/// Label carrying the run UUID.
pub const UUID_LABEL: &str = "kube-burner-uuid";

/// Label carrying the job name.
pub const JOB_LABEL: &str = "kube-burner-job";

/// Label carrying the iteration index.
pub const INDEX_LABEL: &str = "kube-burner-index";

/// Labels stamped on every object created by the engine.
pub fn fingerprint_labels(uuid: &str, job: &str, iteration: u32) -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![
        (UUID_LABEL.to_owned(), uuid.to_owned()),
        (JOB_LABEL.to_owned(), job.to_owned()),
        (INDEX_LABEL.to_owned(), iteration.to_string()),
    ])
}

/// Selector matching all objects created by the run with the given UUID.
pub fn uuid_selector(uuid: &str) -> String {
    format!("{UUID_LABEL}={uuid}")
}

/// Selector matching all objects created by one job of the run.
pub fn job_selector(uuid: &str, job: &str) -> String {
    format!("{UUID_LABEL}={uuid},{JOB_LABEL}={job}")
}

/// Extend the fingerprint labels with user supplied labels.
///
/// Fingerprint labels win on key collision.
pub fn fingerprint_labels_extend(
    mut extra: BTreeMap<String, String>,
    uuid: &str,
    job: &str,
    iteration: u32,
) -> BTreeMap<String, String> {
    extra.extend(fingerprint_labels(uuid, job, iteration));
    extra
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_labels_carry_identity() {
        let labels = fingerprint_labels("1f8e", "api-intensive", 3);
        assert_eq!(labels[UUID_LABEL], "1f8e");
        assert_eq!(labels[JOB_LABEL], "api-intensive");
        assert_eq!(labels[INDEX_LABEL], "3");
    }

    #[test]
    fn extend_does_not_let_user_labels_shadow_identity() {
        let user = BTreeMap::from_iter(vec![
            (UUID_LABEL.to_owned(), "spoofed".to_owned()),
            ("team".to_owned(), "perf".to_owned()),
        ]);
        let labels = fingerprint_labels_extend(user, "1f8e", "api-intensive", 1);
        assert_eq!(labels[UUID_LABEL], "1f8e");
        assert_eq!(labels["team"], "perf");
    }

    #[test]
    fn selectors() {
        assert_eq!(uuid_selector("1f8e"), "kube-burner-uuid=1f8e");
        assert_eq!(
            job_selector("1f8e", "delete-job"),
            "kube-burner-uuid=1f8e,kube-burner-job=delete-job"
        );
    }
}
