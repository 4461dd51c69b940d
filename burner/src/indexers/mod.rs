//! Document sinks for measurements, scraped metrics and alerts.
//!
//! New variants slot in as enum arms without touching producers. A sink
//! failure is reported to the caller but never aborts the run.
use serde_json::Value;
use thiserror::Error;

use crate::config::{IndexerConfig, IndexerType};

pub mod elastic;
pub mod local;

pub use elastic::ElasticIndexer;
pub use local::LocalIndexer;

/// Errors produced by a document sink.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Local sink I/O failure.
    #[error("indexer io error: {0}")]
    Io(#[from] std::io::Error),
    /// Document encoding failure.
    #[error("indexer serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Remote sink rejected the batch after retries.
    #[error("indexer request failed: {0}")]
    Request(String),
    /// The sink configuration is unusable.
    #[error("indexer config error: {0}")]
    Config(String),
}

/// Options for one index call.
#[derive(Debug, Clone, Default)]
pub struct IndexingOpts {
    /// Metric the documents belong to. Groups local files.
    pub metric_name: String,
    /// Job the documents belong to. Empty outside job scope.
    pub job_name: String,
}

/// Uniform sink for documents.
#[derive(Debug)]
pub enum Indexer {
    /// Write document batches as JSON files into a local directory.
    Local(LocalIndexer),
    /// Submit document batches to a remote search index in bulk.
    Elastic(ElasticIndexer),
}

impl Indexer {
    /// Build the sink declared by the config, or None when indexing is off.
    pub fn new(config: &IndexerConfig) -> Result<Option<Self>, IndexerError> {
        match config.indexer_type {
            IndexerType::None => Ok(None),
            IndexerType::Local => Ok(Some(Indexer::Local(LocalIndexer::new(
                &config.metrics_directory,
            )))),
            IndexerType::Elastic => Ok(Some(Indexer::Elastic(ElasticIndexer::new(config)?))),
        }
    }

    /// Index one batch of documents. Returns a short human summary.
    pub async fn index(
        &self,
        documents: &[Value],
        opts: &IndexingOpts,
    ) -> Result<String, IndexerError> {
        if documents.is_empty() {
            return Ok("no documents to index".to_owned());
        }
        match self {
            Indexer::Local(local) => local.index(documents, opts).await,
            Indexer::Elastic(elastic) => elastic.index(documents, opts).await,
        }
    }

    /// Push any buffered documents out to the sink.
    ///
    /// The local sink writes synchronously and has nothing to flush.
    pub async fn flush(&self) -> Result<(), IndexerError> {
        match self {
            Indexer::Local(_) => Ok(()),
            Indexer::Elastic(elastic) => {
                let outcome = elastic.flush().await?;
                tracing::debug!(outcome, "flushed indexer");
                Ok(())
            }
        }
    }

    /// Flush and release the sink.
    ///
    /// This is where a buffered-batch failure surfaces at shutdown; the
    /// caller reports it and carries on.
    pub async fn close(&self) -> Result<(), IndexerError> {
        self.flush().await
    }
}
