//! Recovery Orchestrator
//! Drives the depth-first namespace traversal, applies filters, assigns
//! output paths and aggregates per-entry outcomes.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::content_extractor::{read_run_range, ContentStream};
use crate::directory_index::{DirectoryEntry, DirectoryIndex};
use crate::errors::{EntryError, VolumeError};
use crate::ntfs_parser::{
    decode_record, parse_boot_sector, AttributePayload, DataRun, MftEntry, Volume,
    ATTR_DATA, BOOT_SECTOR_SIZE, ROOT_RECORD,
};
use crate::volume_reader::VolumeReader;

/// Filters and reporting switches for one recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    /// Recover only deleted entries (allocated-only when false).
    pub deleted_only: bool,
    /// Case-sensitive name-suffix filter; files only, directories always
    /// recurse.
    pub extensions: Option<BTreeSet<String>>,
    /// Collect a per-entry report alongside the counters.
    pub verbose: bool,
}

/// Aggregated result of one recovery run. Partial recoveries (short reads
/// against truncated or overwritten regions) are counted apart from clean
/// recoveries and from outright errors.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryOutcome {
    pub recovered: u64,
    pub partial: u64,
    pub skipped: u64,
    pub errored: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<EntryReport>,
}

#[derive(Debug, Serialize)]
pub struct EntryReport {
    pub path: String,
    pub status: &'static str,
    pub detail: String,
}

enum EntryOutcome {
    Recovered { detail: String },
    Partial { obtained: u64, expected: u64 },
    Skipped(String),
    Errored(String),
}

/// Best-effort progress side channel. Implementations must not affect
/// recovery behavior; the engine never waits on the sink.
pub trait ProgressSink: Send + Sync {
    fn begin(&self, _total_entries: u64) {}
    fn entry_visited(&self, _visited: u64) {}
}

/// One open volume image plus the state needed to address MFT records.
pub struct RecoverySession {
    reader: VolumeReader,
    volume: Volume,
    /// Run map of the $MFT's own unnamed $DATA stream.
    mft_runs: Vec<DataRun>,
    mft_size: u64,
    cancelled: Arc<AtomicBool>,
    visited: AtomicU64,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl RecoverySession {
    pub fn open(image: &Path) -> Result<RecoverySession, VolumeError> {
        Self::from_reader(VolumeReader::open(image)?)
    }

    pub fn from_reader(reader: VolumeReader) -> Result<RecoverySession, VolumeError> {
        let boot = reader.read_at(0, BOOT_SECTOR_SIZE).map_err(|_| {
            VolumeError::InvalidGeometry("image shorter than one boot sector".to_string())
        })?;
        let volume = parse_boot_sector(boot)?;
        let (mft_runs, mft_size) = bootstrap_mft_runs(&reader, &volume);
        log::debug!(
            "volume: cluster size {}, MFT at cluster {}, {} extents, {} MFT bytes",
            volume.cluster_size,
            volume.mft_start_cluster,
            mft_runs.len(),
            mft_size
        );
        Ok(RecoverySession {
            reader,
            volume,
            mft_runs,
            mft_size,
            cancelled: Arc::new(AtomicBool::new(false)),
            visited: AtomicU64::new(0),
            progress: None,
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Flag checked between sibling entries; setting it stops the traversal
    /// within one entry's processing time.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn set_progress(&mut self, sink: Arc<dyn ProgressSink>) {
        self.progress = Some(sink);
    }

    /// Fetch the raw bytes of MFT record `n` through the $MFT run map.
    fn record_bytes(&self, n: u64) -> Result<Vec<u8>, EntryError> {
        let record_size = self.volume.mft_record_size as u64;
        let offset = n * record_size;
        if offset + record_size > self.mft_size {
            return Err(EntryError::DanglingReference(n));
        }
        read_run_range(
            &self.reader,
            &self.volume,
            &self.mft_runs,
            offset,
            record_size as usize,
        )
    }

    /// Decode MFT record `n` on demand. A zeroed (never-written) slot is a
    /// dangling reference; a non-zero slot without the FILE magic is an
    /// invalid record, which callers treat as skip-level.
    pub fn entry(&self, n: u64) -> Result<MftEntry, EntryError> {
        let bytes = self.record_bytes(n)?;
        if bytes.iter().take(8).all(|&b| b == 0) {
            return Err(EntryError::DanglingReference(n));
        }
        decode_record(&bytes, n, self.volume.bytes_per_sector)
    }

    /// Resolve a directory-entry reference, rejecting stale links whose
    /// sequence number no longer matches the record's.
    fn resolve_reference(&self, record: u64, sequence: u16) -> Result<MftEntry, EntryError> {
        let entry = self.entry(record).map_err(|e| match e {
            // An unreadable target behind a live index entry is a dangling
            // reference from the walker's point of view.
            EntryError::ShortRead { .. }
            | EntryError::TruncatedImage { .. }
            | EntryError::OutOfRange { .. }
            | EntryError::RunOutOfRange { .. } => EntryError::DanglingReference(record),
            other => other,
        })?;
        if sequence != 0 && entry.sequence != 0 && entry.sequence != sequence {
            return Err(EntryError::DanglingReference(record));
        }
        Ok(entry)
    }

    /// Pre-pass enumeration for progress totals. Errors are ignored; the
    /// count is advisory only.
    pub fn count_entries(&self) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![ROOT_RECORD];
        let mut seen = BTreeSet::new();
        while let Some(record) = stack.pop() {
            if !seen.insert(record) {
                continue;
            }
            let Ok(dir) = self.entry(record) else {
                continue;
            };
            let Ok(index) = DirectoryIndex::open(&dir, &self.reader, &self.volume) else {
                continue;
            };
            for child in index.children().flatten() {
                total += 1;
                if child.is_directory {
                    stack.push(child.record);
                }
            }
        }
        total
    }

    /// Run one full recovery traversal. Per-entry problems are folded into
    /// the returned outcome; only volume-level conditions abort, and those
    /// already did at session open.
    pub fn recover(&self, output_root: &Path, options: &RecoveryOptions) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome::default();
        self.visited.store(0, Ordering::Relaxed);

        if let Some(sink) = &self.progress {
            sink.begin(self.count_entries());
        }

        if let Err(e) = fs::create_dir_all(output_root) {
            self.tally(
                &mut outcome,
                options,
                output_root,
                EntryOutcome::Errored(format!("cannot create output root: {}", e)),
            );
            return outcome;
        }

        let mut path_stack = Vec::new();
        match self.entry(ROOT_RECORD) {
            Ok(root) => self.walk_directory(
                &root,
                Path::new(""),
                output_root,
                options,
                &mut path_stack,
                &mut outcome,
            ),
            Err(e) => self.tally(
                &mut outcome,
                options,
                Path::new("/"),
                EntryOutcome::Errored(format!("root directory unreadable: {}", e)),
            ),
        }

        log::info!(
            "recovery finished: {} recovered, {} partial, {} skipped, {} errored",
            outcome.recovered,
            outcome.partial,
            outcome.skipped,
            outcome.errored
        );
        outcome
    }

    fn walk_directory(
        &self,
        dir: &MftEntry,
        rel: &Path,
        output_root: &Path,
        options: &RecoveryOptions,
        path_stack: &mut Vec<u64>,
        outcome: &mut RecoveryOutcome,
    ) {
        if path_stack.contains(&dir.record_number) {
            self.tally(
                outcome,
                options,
                rel,
                EntryOutcome::Errored(EntryError::DirectoryCycle(dir.record_number).to_string()),
            );
            return;
        }
        path_stack.push(dir.record_number);

        let index = match DirectoryIndex::open(dir, &self.reader, &self.volume) {
            Ok(index) => index,
            Err(e) => {
                self.tally(outcome, options, rel, EntryOutcome::Errored(e.to_string()));
                path_stack.pop();
                return;
            }
        };

        for item in index.children() {
            if self.cancelled.load(Ordering::Relaxed) {
                log::info!("cancellation requested, stopping traversal");
                break;
            }

            let visited = self.visited.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(sink) = &self.progress {
                sink.entry_visited(visited);
            }

            match item {
                Ok(child) => {
                    self.process_child(child, rel, output_root, options, path_stack, outcome)
                }
                Err(e) => {
                    let placeholder = rel.join("<unnamed>");
                    let entry_outcome = if e.is_skip() {
                        EntryOutcome::Skipped(e.to_string())
                    } else {
                        EntryOutcome::Errored(e.to_string())
                    };
                    self.tally(outcome, options, &placeholder, entry_outcome);
                }
            }
        }

        path_stack.pop();
    }

    fn process_child(
        &self,
        child: DirectoryEntry,
        rel: &Path,
        output_root: &Path,
        options: &RecoveryOptions,
        path_stack: &mut Vec<u64>,
        outcome: &mut RecoveryOutcome,
    ) {
        let child_rel = rel.join(&child.name);

        let entry = match self.resolve_reference(child.record, child.sequence) {
            Ok(entry) => entry,
            Err(e) => {
                let entry_outcome = if e.is_skip() {
                    EntryOutcome::Skipped(e.to_string())
                } else {
                    EntryOutcome::Errored(e.to_string())
                };
                self.tally(outcome, options, &child_rel, entry_outcome);
                return;
            }
        };

        if entry.is_directory || child.is_directory {
            // Created before its children so a crash mid-traversal leaves a
            // consistent subtree.
            let out_dir = output_root.join(&child_rel);
            if let Err(e) = fs::create_dir_all(&out_dir) {
                self.tally(
                    outcome,
                    options,
                    &child_rel,
                    EntryOutcome::Errored(format!("cannot create directory: {}", e)),
                );
                return;
            }
            self.walk_directory(&entry, &child_rel, output_root, options, path_stack, outcome);
            return;
        }

        // Allocation-mode filter: deleted-only wants records no longer in
        // use, the default wants live ones.
        if entry.is_in_use == options.deleted_only {
            let reason = if options.deleted_only {
                "not a deleted file"
            } else {
                "deleted file"
            };
            self.tally(
                outcome,
                options,
                &child_rel,
                EntryOutcome::Skipped(reason.to_string()),
            );
            return;
        }

        if let Some(extensions) = &options.extensions {
            let matched = extensions
                .iter()
                .any(|ext| child.name.ends_with(ext.as_str()));
            if !matched {
                self.tally(
                    outcome,
                    options,
                    &child_rel,
                    EntryOutcome::Skipped("does not match requested file types".to_string()),
                );
                return;
            }
        }

        let entry_outcome = self.extract_file(&entry, &child_rel, output_root);
        self.tally(outcome, options, &child_rel, entry_outcome);
    }

    fn extract_file(&self, entry: &MftEntry, rel: &Path, output_root: &Path) -> EntryOutcome {
        let Some(attribute) = entry.data_attribute() else {
            return EntryOutcome::Errored(EntryError::MissingData.to_string());
        };

        if let Some(kind) = attribute.unsupported_encoding() {
            // Degraded mode: report the size, never write undecodable bytes.
            return EntryOutcome::Skipped(format!(
                "unsupported {} content ({} bytes declared)",
                kind,
                attribute.data_size()
            ));
        }
        if matches!(attribute.payload, AttributePayload::Malformed) {
            return EntryOutcome::Errored(EntryError::MalformedDataRuns.to_string());
        }

        let stream = match ContentStream::open(attribute, &self.reader, &self.volume, None) {
            Ok(stream) => stream,
            Err(e) => {
                return if e.is_skip() {
                    EntryOutcome::Skipped(e.to_string())
                } else {
                    EntryOutcome::Errored(e.to_string())
                }
            }
        };

        let out_path = match conflict_free_path(&output_root.join(rel)) {
            Ok(path) => path,
            Err(e) => return EntryOutcome::Errored(format!("cannot assign output path: {}", e)),
        };

        match write_stream(stream, &out_path) {
            Ok(bytes) => EntryOutcome::Recovered {
                detail: self.describe_recovered(entry, bytes, &out_path),
            },
            Err(WriteError::Short { obtained, expected }) => {
                EntryOutcome::Partial { obtained, expected }
            }
            Err(WriteError::Entry(e)) => {
                // Undo the half-written file; unlike a short read, nothing
                // here is a usable prefix of the real content.
                let _ = fs::remove_file(&out_path);
                if e.is_skip() {
                    EntryOutcome::Skipped(e.to_string())
                } else {
                    EntryOutcome::Errored(e.to_string())
                }
            }
        }
    }

    fn describe_recovered(&self, entry: &MftEntry, bytes: u64, out_path: &Path) -> String {
        let modified = entry
            .standard_information()
            .map(|si| format_timestamp(si.modified))
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "{} bytes -> {} (modified {})",
            bytes,
            out_path.display(),
            modified
        )
    }

    fn tally(
        &self,
        outcome: &mut RecoveryOutcome,
        options: &RecoveryOptions,
        rel: &Path,
        entry_outcome: EntryOutcome,
    ) {
        let (status, detail) = match entry_outcome {
            EntryOutcome::Recovered { detail } => {
                outcome.recovered += 1;
                ("recovered", detail)
            }
            EntryOutcome::Partial { obtained, expected } => {
                outcome.partial += 1;
                (
                    "partial",
                    format!("recovered {} of {} bytes", obtained, expected),
                )
            }
            EntryOutcome::Skipped(reason) => {
                outcome.skipped += 1;
                ("skipped", reason)
            }
            EntryOutcome::Errored(cause) => {
                outcome.errored += 1;
                ("errored", cause)
            }
        };

        log::debug!("{}: {} ({})", status, rel.display(), detail);
        if options.verbose {
            outcome.reports.push(EntryReport {
                path: rel.display().to_string(),
                status,
                detail,
            });
        }
    }
}

/// Recover the $MFT's own extent map from record 0. Falls back to one
/// contiguous run from the MFT start cluster when record 0 is unreadable, so
/// a damaged volume still gets a best-effort traversal.
fn bootstrap_mft_runs(reader: &VolumeReader, volume: &Volume) -> (Vec<DataRun>, u64) {
    let record_size = volume.mft_record_size as usize;
    let offset = volume.mft_start_cluster * volume.cluster_size as u64;

    let fallback = || {
        let clusters = volume
            .total_clusters
            .saturating_sub(volume.mft_start_cluster);
        let runs = vec![DataRun {
            start_cluster: volume.mft_start_cluster as i64,
            cluster_count: clusters,
            is_sparse: false,
        }];
        (runs, clusters * volume.cluster_size as u64)
    };

    let Ok(bytes) = reader.read_at(offset, record_size) else {
        log::warn!("$MFT record 0 unreadable, assuming contiguous MFT");
        return fallback();
    };
    let Ok(entry) = decode_record(bytes, 0, volume.bytes_per_sector) else {
        log::warn!("$MFT record 0 does not decode, assuming contiguous MFT");
        return fallback();
    };
    let found = entry.attributes_of(ATTR_DATA).find(|a| a.name.is_empty());
    match found {
        Some(attr) => match &attr.payload {
            AttributePayload::NonResident { data_size, runs } if !runs.is_empty() => {
                (runs.clone(), *data_size)
            }
            _ => {
                log::warn!("$MFT data attribute is not usable, assuming contiguous MFT");
                fallback()
            }
        },
        None => {
            log::warn!("$MFT record 0 has no data attribute, assuming contiguous MFT");
            fallback()
        }
    }
}

enum WriteError {
    Short { obtained: u64, expected: u64 },
    Entry(EntryError),
}

/// Stream content into `path`. On a short read the bytes already obtained
/// stay on disk and the shortfall is reported; the orchestrator counts the
/// file as a partial recovery instead of fabricating padding.
fn write_stream(stream: ContentStream<'_>, path: &Path) -> Result<u64, WriteError> {
    let file = File::create(path).map_err(|e| WriteError::Entry(EntryError::Output(e)))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;

    for chunk in stream {
        match chunk {
            Ok(data) => {
                writer
                    .write_all(data)
                    .map_err(|e| WriteError::Entry(EntryError::Output(e)))?;
                written += data.len() as u64;
            }
            Err(EntryError::ShortRead { obtained, expected }) => {
                let _ = writer.flush();
                return Err(WriteError::Short { obtained, expected });
            }
            Err(e) => {
                let _ = writer.flush();
                return Err(WriteError::Entry(e));
            }
        }
    }

    writer
        .flush()
        .map_err(|e| WriteError::Entry(EntryError::Output(e)))?;
    Ok(written)
}

/// Deterministic conflict resolution: probe the filesystem (not an in-memory
/// set, so resumed runs stay safe) and insert `_<n>` before the extension
/// until a free name is found.
fn conflict_free_path(path: &Path) -> std::io::Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = match &extension {
            Some(ext) => parent.join(format!("{}_{}.{}", stem, n, ext)),
            None => parent.join(format!("{}_{}", stem, n)),
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}

fn format_timestamp(unix_ts: i64) -> String {
    if unix_ts <= 0 {
        return "unknown".to_string();
    }
    chrono::DateTime::from_timestamp(unix_ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
