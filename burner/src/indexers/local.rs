//! Local directory sink and tarball packaging.
use std::path::{Path, PathBuf};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde_json::Value;
use tracing::{info, warn};

use super::{Indexer, IndexerError, IndexingOpts};

/// Writes each document batch as a JSON file, grouped by metric name.
#[derive(Debug)]
pub struct LocalIndexer {
    directory: PathBuf,
}

impl LocalIndexer {
    /// Sink writing into the given directory. Created on first batch.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Directory documents are written into.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_for(&self, opts: &IndexingOpts) -> PathBuf {
        let stem = if opts.job_name.is_empty() {
            opts.metric_name.clone()
        } else {
            format!("{}-{}", opts.metric_name, opts.job_name)
        };
        self.directory.join(format!("{stem}.json"))
    }

    pub(super) async fn index(
        &self,
        documents: &[Value],
        opts: &IndexingOpts,
    ) -> Result<String, IndexerError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self.file_for(opts);
        // Later batches for the same metric append rather than truncate
        let mut merged: Vec<Value> = match tokio::fs::read(&path).await {
            Ok(existing) => serde_json::from_slice(&existing)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        merged.extend_from_slice(documents);
        let count = merged.len();
        tokio::fs::write(&path, serde_json::to_vec_pretty(&merged)?).await?;
        Ok(format!(
            "wrote {count} documents to {}",
            path.display()
        ))
    }
}

/// Package a metrics directory as a gzip-compressed tarball.
pub fn create_tarball(directory: &Path, tarball: &Path) -> Result<(), IndexerError> {
    let file = std::fs::File::create(tarball)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        builder.append_path_with_name(entry.path(), entry.file_name())?;
    }
    builder.into_inner()?.finish()?;
    info!(tarball = %tarball.display(), "created metrics tarball");
    Ok(())
}

/// Restore a tarball through a sink.
///
/// Each tarball entry is a JSON array of documents; the file stem becomes the
/// metric name so a local sink reproduces the original layout.
pub async fn import_tarball(tarball: &Path, indexer: &Indexer) -> Result<(), IndexerError> {
    let file = std::fs::File::open(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
            warn!(path = %path.display(), "skipping tarball entry without a name");
            continue;
        };
        let mut raw = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut raw)?;
        let documents: Vec<Value> = serde_json::from_slice(&raw)?;
        let summary = indexer
            .index(
                &documents,
                &IndexingOpts {
                    metric_name: stem,
                    job_name: String::new(),
                },
            )
            .await?;
        info!(summary, "imported tarball entry");
    }
    Ok(())
}
