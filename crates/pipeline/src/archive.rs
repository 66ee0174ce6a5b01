//! Streaming ZIP assembly for finished batches.
//!
//! A blocking task writes the ZIP into an anonymous spool file, then sends
//! it back through [`ChannelWriter`], which forwards fixed-size chunks over
//! a bounded channel. Memory use is bounded by the channel depth times the
//! chunk size, whatever the size of the batch.
//!
//! Every output file is opened before [`ArchiveAssembler::build`] returns,
//! so a sweep that deletes the batch directory mid-download cannot truncate
//! the archive.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::Bytes;
use inkbatch_core::batch::{Batch, BatchStatus, ItemState};
use inkbatch_core::error::CoreError;
use inkbatch_core::types::{BatchId, Timestamp};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::store::BatchStore;

/// Name of the manifest entry, always first in the archive.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the writer task and the consumer.
const CHANNEL_DEPTH: usize = 8;

pub type ArchiveStream = ReceiverStream<io::Result<Bytes>>;

/// A ready-to-send archive.
#[derive(Debug)]
pub struct Archive {
    /// Suggested download name.
    pub file_name: String,
    pub stream: ArchiveStream,
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub label: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFailure {
    pub index: usize,
    pub label: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestSkipped {
    pub index: usize,
    pub label: String,
}

/// Summary written as the first archive entry, so a failed item is
/// distinguishable from one that is simply absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_bytes: u64,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub entries: Vec<ManifestEntry>,
    pub failures: Vec<ManifestFailure>,
    pub skipped_items: Vec<ManifestSkipped>,
}

impl Manifest {
    pub fn from_batch(batch: &Batch) -> Self {
        let mut entries = Vec::new();
        let mut failures = Vec::new();
        let mut skipped_items = Vec::new();

        for item in &batch.items {
            match (&item.state, &item.output) {
                (ItemState::Done, Some(output)) => entries.push(ManifestEntry {
                    index: item.index,
                    label: item.label.clone(),
                    file_name: output.file_name.clone(),
                    size_bytes: output.size_bytes,
                    sha256: output.sha256.clone(),
                    content_type: output.content_type.clone(),
                }),
                (ItemState::Failed, _) => failures.push(ManifestFailure {
                    index: item.index,
                    label: item.label.clone(),
                    error: item.error.clone().unwrap_or_default(),
                    attempts: item.attempts,
                }),
                _ => skipped_items.push(ManifestSkipped {
                    index: item.index,
                    label: item.label.clone(),
                }),
            }
        }

        Self {
            batch_id: batch.id,
            status: batch.status,
            total: batch.total_count,
            processed: batch.processed_count,
            failed: batch.failed_count,
            skipped: batch.skipped_count(),
            total_bytes: batch.total_bytes,
            created_at: batch.created_at,
            completed_at: batch.completed_at,
            entries,
            failures,
            skipped_items,
        }
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

struct EntrySource {
    file_name: String,
    file: File,
}

pub struct ArchiveAssembler {
    store: Arc<BatchStore>,
}

impl ArchiveAssembler {
    pub fn new(store: Arc<BatchStore>) -> Self {
        Self { store }
    }

    /// Start streaming the archive of a terminal batch.
    ///
    /// Fails with `NotReady` while the batch is still pending or processing,
    /// and with `Internal` if a stored output cannot be opened. I/O errors
    /// that occur once streaming has begun surface as an `Err` item on the
    /// stream.
    pub fn build(&self, id: BatchId) -> Result<Archive, CoreError> {
        let batch = self.store.get(id)?;
        if !batch.status.is_terminal() {
            return Err(CoreError::NotReady {
                id,
                status: batch.status,
            });
        }

        let manifest = serde_json::to_vec_pretty(&Manifest::from_batch(&batch))
            .map_err(|e| CoreError::Internal(format!("Failed to encode manifest: {e}")))?;
        let sources = batch
            .items
            .iter()
            .filter(|item| item.state == ItemState::Done)
            .filter_map(|item| item.output.as_ref())
            .map(|output| {
                let file = File::open(&output.path).map_err(|e| {
                    CoreError::Internal(format!(
                        "Failed to open output {}: {e}",
                        output.path.display()
                    ))
                })?;
                Ok(EntrySource {
                    file_name: output.file_name.clone(),
                    file,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        tracing::debug!(
            batch_id = %id,
            entries = sources.len(),
            "Streaming batch archive",
        );

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::task::spawn_blocking(move || {
            let writer = ChannelWriter::new(tx.clone());
            if let Err(e) = write_archive(writer, &manifest, sources) {
                tracing::error!(batch_id = %id, error = %e, "Archive stream failed");
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(Archive {
            file_name: format!("batch-{id}.zip"),
            stream: ReceiverStream::new(rx),
        })
    }
}

/// Write the ZIP into a spool file, then copy the spool to `out`.
fn write_archive<W: Write>(
    mut out: W,
    manifest: &[u8],
    sources: Vec<EntrySource>,
) -> io::Result<()> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(tempfile::tempfile()?);

    zip.start_file(MANIFEST_FILE_NAME, options)
        .map_err(io::Error::other)?;
    zip.write_all(manifest)?;

    for mut source in sources {
        zip.start_file(source.file_name.as_str(), options)
            .map_err(io::Error::other)?;
        io::copy(&mut source.file, &mut zip)?;
    }

    let mut spool = zip.finish().map_err(io::Error::other)?;
    spool.seek(SeekFrom::Start(0))?;
    io::copy(&mut spool, &mut out)?;
    out.flush()
}

// ---------------------------------------------------------------------------
// ChannelWriter
// ---------------------------------------------------------------------------

/// `io::Write` adapter that ships its output as `Bytes` chunks over a
/// bounded channel. Must only be used from a blocking context.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let _ = self.send_buffered();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
