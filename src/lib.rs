//! NTFS file recovery engine for disk images.
//!
//! Walks the directory tree of a raw NTFS image through the MFT, extracts
//! file content (resident or run-mapped), and writes the recovered tree to a
//! destination directory. Works allocated-first or deleted-only, with
//! optional extension filtering.

pub mod content_extractor;
pub mod directory_index;
pub mod errors;
pub mod ntfs_parser;
pub mod recovery_engine;
pub mod volume_reader;

#[cfg(test)]
pub(crate) mod testsupport;

use std::path::Path;

pub use errors::{EntryError, VolumeError};
pub use recovery_engine::{
    EntryReport, ProgressSink, RecoveryOptions, RecoveryOutcome, RecoverySession,
};
pub use volume_reader::VolumeReader;

/// One-shot recovery: open `image`, traverse, write under `output_root`.
pub fn recover(
    image: &Path,
    output_root: &Path,
    options: &RecoveryOptions,
) -> Result<RecoveryOutcome, VolumeError> {
    let session = RecoverySession::open(image)?;
    Ok(session.recover(output_root, options))
}
