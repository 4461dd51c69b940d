//! Remote search-index sink submitting NDJSON bulk batches.
use std::time::Duration;

use serde_json::{json, Value};
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, warn};

use super::{IndexerError, IndexingOpts};
use crate::config::IndexerConfig;

const MAX_BATCH_DOCS: usize = 500;
const MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);

/// Submits documents to a search-index `_bulk` endpoint.
///
/// Documents are buffered and shipped in full batches; the remainder goes
/// out on [`ElasticIndexer::flush`], so a shutdown without a flush can lose
/// the tail of a run.
#[derive(Debug)]
pub struct ElasticIndexer {
    client: reqwest::Client,
    server: String,
    index: String,
    buffer: Mutex<Vec<Value>>,
}

impl ElasticIndexer {
    /// Sink towards the first configured server.
    pub fn new(config: &IndexerConfig) -> Result<Self, IndexerError> {
        let server = config
            .servers
            .first()
            .ok_or_else(|| IndexerError::Config("elastic indexer without servers".to_owned()))?
            .trim_end_matches('/')
            .to_owned();
        if config.index.is_empty() {
            return Err(IndexerError::Config(
                "elastic indexer without an index".to_owned(),
            ));
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| IndexerError::Config(err.to_string()))?;
        Ok(Self {
            client,
            server,
            index: config.index.clone(),
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub(super) async fn index(
        &self,
        documents: &[Value],
        opts: &IndexingOpts,
    ) -> Result<String, IndexerError> {
        let mut buffer = self.buffer.lock().await;
        buffer.extend_from_slice(documents);
        let mut submitted = 0;
        while buffer.len() >= MAX_BATCH_DOCS {
            let full: Vec<Value> = buffer.drain(..MAX_BATCH_DOCS).collect();
            for batch in batches(&full, &self.index)? {
                self.submit(&batch.body).await?;
                submitted += batch.docs;
                debug!(
                    metric = opts.metric_name,
                    docs = batch.docs,
                    "submitted bulk batch"
                );
            }
        }
        Ok(format!(
            "submitted {submitted} documents to {}/{}, {} buffered",
            self.server,
            self.index,
            buffer.len()
        ))
    }

    /// Ship every buffered document, regardless of batch fill.
    pub(super) async fn flush(&self) -> Result<String, IndexerError> {
        let remainder: Vec<Value> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        let mut submitted = 0;
        for batch in batches(&remainder, &self.index)? {
            self.submit(&batch.body).await?;
            submitted += batch.docs;
        }
        Ok(format!(
            "flushed {submitted} documents to {}/{}",
            self.server, self.index
        ))
    }

    async fn submit(&self, body: &str) -> Result<(), IndexerError> {
        let url = format!("{}/_bulk", self.server);
        let mut attempt = 1;
        loop {
            let outcome = self
                .client
                .post(&url)
                .header("Content-Type", "application/x-ndjson")
                .body(body.to_owned())
                .send()
                .await;
            let err = match outcome {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => format!("unexpected status {}", resp.status()),
                Err(err) => err.to_string(),
            };
            if attempt >= MAX_ATTEMPTS {
                return Err(IndexerError::Request(err));
            }
            let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
            warn!(attempt, %err, ?backoff, "bulk request failed, backing off");
            attempt += 1;
            sleep(backoff).await;
        }
    }
}

struct Batch {
    body: String,
    docs: usize,
}

/// Split documents into NDJSON bulk bodies bounded by count and bytes.
fn batches(documents: &[Value], index: &str) -> Result<Vec<Batch>, IndexerError> {
    let action = serde_json::to_string(&json!({"index": {"_index": index}}))?;
    let mut out = Vec::new();
    let mut body = String::new();
    let mut docs = 0;
    for document in documents {
        let line = serde_json::to_string(document)?;
        if docs > 0 && (docs >= MAX_BATCH_DOCS || body.len() + line.len() > MAX_BATCH_BYTES) {
            out.push(Batch {
                body: std::mem::take(&mut body),
                docs: std::mem::replace(&mut docs, 0),
            });
        }
        body.push_str(&action);
        body.push('\n');
        body.push_str(&line);
        body.push('\n');
        docs += 1;
    }
    if docs > 0 {
        out.push(Batch { body, docs });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexer() -> ElasticIndexer {
        ElasticIndexer::new(&IndexerConfig {
            indexer_type: crate::config::IndexerType::Elastic,
            servers: vec!["http://localhost:9200".to_owned()],
            index: "kube-burner".to_owned(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn batches_split_on_count() {
        let docs: Vec<Value> = (0..MAX_BATCH_DOCS + 10)
            .map(|i| json!({"value": i}))
            .collect();
        let batches = batches(&docs, "kube-burner").unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].docs, MAX_BATCH_DOCS);
        assert_eq!(batches[1].docs, 10);
    }

    #[test]
    fn batch_bodies_are_ndjson_pairs() {
        let docs = vec![json!({"a": 1}), json!({"b": 2})];
        let batches = batches(&docs, "perf").unwrap();
        assert_eq!(batches.len(), 1);
        let lines: Vec<&str> = batches[0].body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], r#"{"index":{"_index":"perf"}}"#);
        assert_eq!(lines[1], r#"{"a":1}"#);
    }

    #[test]
    fn missing_server_is_a_config_error() {
        let config = IndexerConfig {
            indexer_type: crate::config::IndexerType::Elastic,
            index: "kube-burner".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            ElasticIndexer::new(&config),
            Err(IndexerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn partial_batches_stay_buffered_until_flush() {
        let sink = indexer();
        // Below the batch size nothing is shipped, so no network is touched
        let outcome = sink
            .index(
                &[json!({"a": 1}), json!({"b": 2})],
                &IndexingOpts {
                    metric_name: "podLatency".to_owned(),
                    job_name: String::new(),
                },
            )
            .await
            .unwrap();
        assert!(outcome.contains("submitted 0 documents"));
        assert_eq!(sink.buffer.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn flush_with_empty_buffer_is_a_noop() {
        let sink = indexer();
        let outcome = sink.flush().await.unwrap();
        assert!(outcome.contains("flushed 0 documents"));
    }
}
