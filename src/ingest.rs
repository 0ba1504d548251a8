use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{ArchiveManifestEntry, CompoundRecord, ProcessedArchiveRecord};
use crate::error::MolidError;
use crate::extract;
use crate::sdf;
use crate::store::{DEFAULT_BUSY_TIMEOUT, MasterStore, WriterLock};
use crate::transfer::ArchiveSource;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Listing,
    Selecting,
    Downloading,
    Validating,
    Extracting,
    Parsing,
    Inserting,
    Marking,
    Cleaning,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub download_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub max_archives: Option<usize>,
    pub batch_size: usize,
    pub max_consecutive_failures: usize,
    pub busy_timeout: Duration,
}

impl UpdateOptions {
    pub fn new(download_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            staging_dir: staging_dir.into(),
            max_archives: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateSummary {
    pub listed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub records_inserted: u64,
    pub records_dropped: u64,
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct ArchiveCounts {
    inserted: u64,
    dropped: u64,
}

/// Drives resumable ingestion of remote SDF archives into the master store.
pub struct Ingestor<S: ArchiveSource> {
    source: S,
}

impl<S: ArchiveSource> Ingestor<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// One ingestion run. The writer lock is held until the run returns.
    pub fn run(
        &self,
        db_path: &Path,
        options: &UpdateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UpdateSummary, MolidError> {
        let started = Instant::now();
        let _lock = WriterLock::acquire(db_path)?;
        let mut store = MasterStore::create(db_path)?;
        store.set_busy_timeout(options.busy_timeout)?;
        let mut summary = UpdateSummary::default();

        emit(sink, Phase::Listing, "listing remote archives".to_string(), None);
        let listed = self.source.list_remote_archives()?;
        summary.listed = listed.len();

        emit(
            sink,
            Phase::Selecting,
            format!("{} archives listed", listed.len()),
            None,
        );
        let mut pending = Vec::new();
        for entry in listed {
            if store.is_archive_processed(&entry.name)? {
                summary.skipped += 1;
            } else {
                pending.push(entry);
            }
        }
        if let Some(limit) = options.max_archives {
            pending.truncate(limit);
        }
        info!(
            pending = pending.len(),
            skipped = summary.skipped,
            "archives selected"
        );

        let mut consecutive_failures = 0usize;
        for entry in &pending {
            let archive_started = Instant::now();
            match self.ingest_archive(&mut store, entry, options, sink) {
                Ok(counts) => {
                    consecutive_failures = 0;
                    summary.processed += 1;
                    summary.records_inserted += counts.inserted;
                    summary.records_dropped += counts.dropped;
                    info!(
                        archive = %entry.name,
                        records = counts.inserted,
                        dropped = counts.dropped,
                        elapsed_ms = archive_started.elapsed().as_millis() as u64,
                        "archive ingested"
                    );
                }
                Err(err) if err.skips_archive() => {
                    consecutive_failures += 1;
                    summary.failed += 1;
                    error!(archive = %entry.name, error = %err, "archive skipped");
                    if options.max_consecutive_failures > 0
                        && consecutive_failures >= options.max_consecutive_failures
                    {
                        warn!(
                            failures = consecutive_failures,
                            "too many consecutive failures; stopping run"
                        );
                        summary.aborted = true;
                        break;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        emit(
            sink,
            Phase::Done,
            format!(
                "processed={} skipped={} failed={}",
                summary.processed, summary.skipped, summary.failed
            ),
            Some(started.elapsed()),
        );
        Ok(summary)
    }

    fn ingest_archive(
        &self,
        store: &mut MasterStore,
        entry: &ArchiveManifestEntry,
        options: &UpdateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ArchiveCounts, MolidError> {
        emit(sink, Phase::Downloading, entry.name.clone(), None);
        // A failed download leaves the partial file for the next run to resume.
        let archive = self.source.download(entry, &options.download_dir)?;

        emit(sink, Phase::Validating, entry.name.clone(), None);
        let staged = extract::staged_path(&archive, &options.staging_dir);
        // Validation happens while inflating, so the archive is decoded once.
        let unpacked = match extract::unpack(&archive, &options.staging_dir) {
            Ok(path) => path,
            Err(err) => {
                discard_failed(&err, &staged, &archive);
                return Err(err);
            }
        };

        emit(sink, Phase::Extracting, entry.name.clone(), None);
        let result = extract::SdfRecords::open(&unpacked)
            .and_then(|records| self.load_records(store, entry, records, options, sink));

        match result {
            Ok(counts) => {
                emit(sink, Phase::Marking, entry.name.clone(), None);
                let marked = store.mark_archive_processed(&ProcessedArchiveRecord::now(
                    &entry.name,
                    counts.inserted,
                ));
                emit(sink, Phase::Cleaning, entry.name.clone(), None);
                if marked.is_ok() {
                    extract::cleanup(&[staged.as_path(), archive.as_path()]);
                } else {
                    extract::cleanup(&[staged.as_path()]);
                }
                marked.map(|()| counts)
            }
            Err(err) => {
                discard_failed(&err, &staged, &archive);
                Err(err)
            }
        }
    }

    fn load_records<I>(
        &self,
        store: &mut MasterStore,
        entry: &ArchiveManifestEntry,
        records: I,
        options: &UpdateOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ArchiveCounts, MolidError>
    where
        I: Iterator<Item = Result<String, MolidError>>,
    {
        emit(sink, Phase::Parsing, entry.name.clone(), None);
        let batch_size = options.batch_size.max(1);
        let mut counts = ArchiveCounts::default();
        let mut batch: Vec<CompoundRecord> = Vec::with_capacity(batch_size);

        for block in records {
            match sdf::parse_record(&block?) {
                Ok(Some(record)) => batch.push(record),
                Ok(None) => counts.dropped += 1,
                Err(err) => {
                    warn!(archive = %entry.name, error = %err, "record dropped");
                    counts.dropped += 1;
                }
            }
            if batch.len() >= batch_size {
                counts.inserted += flush(store, &mut batch, entry, sink)?;
            }
        }
        if !batch.is_empty() {
            counts.inserted += flush(store, &mut batch, entry, sink)?;
        }
        Ok(counts)
    }
}

fn flush(
    store: &mut MasterStore,
    batch: &mut Vec<CompoundRecord>,
    entry: &ArchiveManifestEntry,
    sink: &dyn ProgressSink,
) -> Result<u64, MolidError> {
    emit(
        sink,
        Phase::Inserting,
        format!("{}: {} records", entry.name, batch.len()),
        None,
    );
    let inserted = store.insert_batch(batch)?;
    batch.clear();
    Ok(inserted as u64)
}

/// Only a corrupt archive is deleted; anything else is kept for the next run.
fn discard_failed(err: &MolidError, staged: &Path, archive: &Path) {
    if matches!(err, MolidError::CorruptArchive { .. }) {
        extract::cleanup(&[staged, archive]);
    } else {
        extract::cleanup(&[staged]);
    }
}

fn emit(sink: &dyn ProgressSink, phase: Phase, message: String, elapsed: Option<Duration>) {
    sink.event(ProgressEvent {
        phase,
        message,
        elapsed,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = UpdateOptions::new("dl", "staging");
        assert_eq!(options.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(options.max_consecutive_failures, 3);
        assert_eq!(options.max_archives, None);
        assert_eq!(options.busy_timeout, Duration::from_secs(30));
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Downloading.to_string(), "Downloading");
    }
}
