//! Post-run alert evaluation.
//!
//! Alert expressions follow the boolean convention: any series with a
//! non-zero sample inside the window fires the alert. This is a report over
//! a recorded range, not a live monitor.
use std::collections::BTreeMap;

use k8s_openapi::chrono::{DateTime, Utc};
use minijinja::Environment;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    config::{AlertProfileEntry, Severity},
    indexers::{Indexer, IndexingOpts},
    prometheus::{self, Series},
};

/// One fired alert.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Time of the first offending sample.
    pub timestamp: String,
    /// Run identity.
    pub uuid: String,
    /// Severity of the profile entry.
    pub severity: &'static str,
    /// Rendered description.
    pub description: String,
    /// The expression that fired.
    pub expr: String,
    /// Document grouping name.
    pub metric_name: &'static str,
}

/// Evaluates an alert profile over a time range.
pub struct AlertManager {
    profile: Vec<AlertProfileEntry>,
    uuid: String,
    metadata: BTreeMap<String, Value>,
}

impl AlertManager {
    /// Manager for one parsed profile.
    pub fn new(
        profile: Vec<AlertProfileEntry>,
        uuid: &str,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            profile,
            uuid: uuid.to_owned(),
            metadata,
        }
    }

    /// Evaluate every entry over [start, end], index fired alerts, and report
    /// whether any critical entry fired.
    pub async fn evaluate(
        &self,
        client: &prometheus::Client,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        indexer: Option<&Indexer>,
    ) -> bool {
        let mut critical = false;
        let mut documents = Vec::new();
        for entry in &self.profile {
            let series = match client.range_query(&entry.expr, start, end).await {
                Ok(series) => series,
                Err(err) => {
                    warn!(expr = entry.expr, %err, "skipping alert entry");
                    continue;
                }
            };
            for alert in fired_alerts(entry, &series, &self.uuid) {
                match entry.severity {
                    Severity::Critical => {
                        critical = true;
                        error!(alert.description, expr = entry.expr, "critical alert");
                    }
                    Severity::Warning => warn!(alert.description, expr = entry.expr, "alert"),
                    Severity::Info => info!(alert.description, expr = entry.expr, "alert"),
                }
                if let Ok(mut value) = serde_json::to_value(&alert) {
                    if let Some(map) = value.as_object_mut() {
                        for (key, extra) in &self.metadata {
                            map.insert(key.clone(), extra.clone());
                        }
                    }
                    documents.push(value);
                }
            }
        }
        if let Some(indexer) = indexer {
            let opts = IndexingOpts {
                metric_name: "alert".to_owned(),
                job_name: String::new(),
            };
            if let Err(err) = indexer.index(&documents, &opts).await {
                error!(%err, "failed to index alerts");
            }
        }
        critical
    }
}

/// Alerts fired by one profile entry over the returned series.
///
/// Each offending series produces one alert, timestamped at its first
/// non-zero sample.
pub(crate) fn fired_alerts(
    entry: &AlertProfileEntry,
    series: &[Series],
    uuid: &str,
) -> Vec<Alert> {
    let mut alerts = Vec::new();
    for series in series {
        let Some((ts, value)) = series
            .samples()
            .into_iter()
            .find(|(_, value)| *value != 0.0 && value.is_finite())
        else {
            continue;
        };
        alerts.push(Alert {
            timestamp: DateTime::from_timestamp(ts as i64, 0)
                .unwrap_or_else(Utc::now)
                .to_rfc3339(),
            uuid: uuid.to_owned(),
            severity: entry.severity.as_str(),
            description: render_description(&entry.description, &series.metric, value),
            expr: entry.expr.clone(),
            metric_name: "alert",
        });
    }
    alerts
}

/// Render an alert description with `labels` and `value` in scope.
///
/// Descriptions are best-effort: a template error falls back to the raw
/// text rather than dropping the alert.
fn render_description(template: &str, labels: &BTreeMap<String, String>, value: f64) -> String {
    let mut env = Environment::new();
    if env.add_template("description", template).is_err() {
        return template.to_owned();
    }
    let tmpl = match env.get_template("description") {
        Ok(tmpl) => tmpl,
        Err(_) => return template.to_owned(),
    };
    tmpl.render(minijinja::context! { labels => labels, value => value })
        .unwrap_or_else(|_| template.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Severity;

    fn entry(severity: Severity) -> AlertProfileEntry {
        AlertProfileEntry {
            expr: "up == 0".to_owned(),
            severity,
            description: "instance {{ labels.instance }} down (value {{ value }})".to_owned(),
        }
    }

    fn series(samples: Vec<(f64, &str)>) -> Series {
        serde_json::from_value(serde_json::json!({
            "metric": {"instance": "node-a"},
            "values": samples
                .into_iter()
                .map(|(ts, v)| serde_json::json!([ts, v]))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn non_zero_sample_fires_once_per_series() {
        let alerts = fired_alerts(
            &entry(Severity::Critical),
            &[series(vec![
                (1_700_000_000.0, "0"),
                (1_700_000_030.0, "1"),
                (1_700_000_060.0, "1"),
            ])],
            "1f8e",
        );
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.severity, "critical");
        assert_eq!(alert.uuid, "1f8e");
        assert_eq!(alert.description, "instance node-a down (value 1.0)");
        assert!(alert.timestamp.starts_with("2023-11-14T22:13:50"));
    }

    #[test]
    fn all_zero_series_does_not_fire() {
        let alerts = fired_alerts(
            &entry(Severity::Warning),
            &[series(vec![(1_700_000_000.0, "0"), (1_700_000_030.0, "0")])],
            "1f8e",
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn empty_result_does_not_fire() {
        assert!(fired_alerts(&entry(Severity::Critical), &[], "1f8e").is_empty());
    }

    #[test]
    fn description_errors_fall_back_to_raw_text() {
        let broken = AlertProfileEntry {
            expr: "up == 0".to_owned(),
            severity: Severity::Info,
            description: "bad {{ template".to_owned(),
        };
        let alerts = fired_alerts(&broken, &[series(vec![(1_700_000_000.0, "1")])], "u");
        assert_eq!(alerts[0].description, "bad {{ template");
    }
}
