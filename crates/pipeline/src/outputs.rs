//! On-disk storage for item outputs.
//!
//! Layout: `<root>/<batch_id>/<index:04>-<sanitized file name>`. Outputs
//! live on disk rather than in the batch record so large batches do not
//! pin their images in memory; the archive assembler streams them back.

use std::io;
use std::path::{Path, PathBuf};

use inkbatch_core::batch::OutputRef;
use inkbatch_core::types::BatchId;
use sha2::{Digest, Sha256};

use crate::unit_of_work::RenderedOutput;

/// Longest file name kept after sanitizing (excluding the index prefix).
const MAX_FILE_NAME_LEN: usize = 120;

pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_dir(&self, batch_id: BatchId) -> PathBuf {
        self.root.join(batch_id.to_string())
    }

    /// Write one item's output and return a reference to it.
    pub async fn write(
        &self,
        batch_id: BatchId,
        index: usize,
        output: &RenderedOutput,
    ) -> io::Result<OutputRef> {
        let dir = self.batch_dir(batch_id);
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = format!("{index:04}-{}", sanitize_file_name(&output.file_name));
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &output.bytes).await?;

        let digest = Sha256::digest(&output.bytes);

        Ok(OutputRef {
            file_name,
            path,
            size_bytes: output.bytes.len() as u64,
            sha256: format!("{digest:x}"),
            content_type: output.content_type.clone(),
        })
    }

    /// Delete every output of a batch. A missing directory is not an error.
    pub async fn remove_batch(&self, batch_id: BatchId) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.batch_dir(batch_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete every batch directory under the root for which `is_live`
    /// returns false. Entries whose name is not a batch id are left alone.
    /// Returns the ids that were removed.
    pub async fn remove_orphans(
        &self,
        is_live: impl Fn(BatchId) -> bool,
    ) -> io::Result<Vec<BatchId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut removed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| BatchId::parse_str(name).ok())
            else {
                continue;
            };
            if is_live(id) || !entry.file_type().await?.is_dir() {
                continue;
            }
            self.remove_batch(id).await?;
            removed.push(id);
        }
        Ok(removed)
    }
}

/// Reduce a suggested file name to `[A-Za-z0-9._-]`, without leading dots
/// or path components. Never returns an empty string.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    let truncated: String = trimmed.chars().take(MAX_FILE_NAME_LEN).collect();

    if truncated.is_empty() {
        "output.bin".to_string()
    } else {
        truncated
    }
}
