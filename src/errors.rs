//! Error taxonomy for the recovery engine.
//!
//! Two levels: `VolumeError` makes the whole volume unreadable and aborts
//! `recover()`; `EntryError` affects a single MFT entry and is folded into
//! the per-entry outcome while traversal continues.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions. `recover()` returns one of these and nothing else.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("failed to open image {path}: {source}")]
    ImageOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not an NTFS volume: OEM signature missing")]
    NotNtfs,

    #[error("invalid NTFS geometry: {0}")]
    InvalidGeometry(String),
}

/// Per-entry conditions. Always caught at the affected entry and recorded;
/// never aborts the traversal.
#[derive(Debug, Error)]
pub enum EntryError {
    /// Record slot carries data but not the FILE magic. Counted as skipped.
    #[error("record {0} has no FILE signature")]
    InvalidRecord(u64),

    /// Directory entry points outside the MFT, at a never-written slot, or
    /// at a record with a stale sequence number. Counted as errored.
    #[error("dangling reference to record {0}")]
    DanglingReference(u64),

    #[error("data run list not terminated within attribute bounds")]
    MalformedDataRuns,

    #[error("malformed attribute or index node header")]
    MalformedAttribute,

    #[error("cluster run {start}..+{count} outside volume of {total} clusters")]
    RunOutOfRange { start: i64, count: u64, total: u64 },

    /// Requested offset lies beyond the end of the image.
    #[error("read at offset {offset} beyond image of {image_len} bytes")]
    OutOfRange { offset: u64, image_len: u64 },

    /// Image ends mid-request; common with partial dumps.
    #[error("image truncated: wanted {wanted} bytes at offset {offset}, {available} available")]
    TruncatedImage {
        offset: u64,
        wanted: usize,
        available: u64,
    },

    /// Content could only be partially read; `obtained` bytes were delivered
    /// before the failure. The designed path for overwritten deleted data.
    #[error("short read: obtained {obtained} of {expected} bytes")]
    ShortRead { obtained: u64, expected: u64 },

    /// Compressed, encrypted, or sparse payload. Size is known, content
    /// recovery is skipped.
    #[error("unsupported attribute encoding: {0}")]
    UnsupportedAttribute(&'static str),

    #[error("entry has no usable filename attribute")]
    MissingFileName,

    #[error("entry has no data attribute")]
    MissingData,

    /// A directory reachable through itself; corrupt index structure.
    #[error("directory cycle through record {0}")]
    DirectoryCycle(u64),

    #[error("output I/O: {0}")]
    Output(#[from] std::io::Error),
}

impl EntryError {
    /// Skip-level problems are expected volume shapes (filtered, unreadable
    /// slots, unsupported encodings); everything else counts as an error.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            EntryError::InvalidRecord(_)
                | EntryError::MissingFileName
                | EntryError::UnsupportedAttribute(_)
        )
    }
}
