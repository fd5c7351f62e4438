//! Volume Reader
//! Maps a byte-addressable disk image into sector/cluster-addressable reads.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::errors::{EntryError, VolumeError};
use crate::ntfs_parser::Volume;

enum ImageSource {
    Mapped(Mmap),
    Buffer(Vec<u8>),
}

/// Read-only view of a volume image. All reads go through `&self`, so the
/// reader is shareable; position is never stored.
pub struct VolumeReader {
    source: ImageSource,
}

impl VolumeReader {
    /// Memory-map an image file.
    pub fn open(path: &Path) -> Result<Self, VolumeError> {
        let file = File::open(path).map_err(|e| VolumeError::ImageOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        // Read-only map of a regular file; the file handle outlives the map.
        let map = unsafe {
            Mmap::map(&file).map_err(|e| VolumeError::ImageOpen {
                path: path.to_path_buf(),
                source: e,
            })?
        };
        Ok(VolumeReader {
            source: ImageSource::Mapped(map),
        })
    }

    /// Wrap an in-memory image. Used by tests and callers that already hold
    /// the bytes (e.g. an uploaded image buffer).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        VolumeReader {
            source: ImageSource::Buffer(bytes),
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.source {
            ImageSource::Mapped(map) => map,
            ImageSource::Buffer(buf) => buf,
        }
    }

    /// Total image length in bytes.
    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Read exactly `len` bytes at `offset`. `OutOfRange` if the offset is
    /// past the image end, `TruncatedImage` if the image ends mid-request.
    /// Never pads.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<&[u8], EntryError> {
        let data = self.bytes();
        let image_len = data.len() as u64;
        if offset > image_len {
            return Err(EntryError::OutOfRange { offset, image_len });
        }
        let end = offset + len as u64;
        if end > image_len {
            return Err(EntryError::TruncatedImage {
                offset,
                wanted: len,
                available: image_len - offset,
            });
        }
        Ok(&data[offset as usize..end as usize])
    }

    /// Read `count` whole clusters starting at logical cluster `start`.
    /// Returns exactly `count * cluster_size` bytes or fails.
    pub fn read_clusters(
        &self,
        volume: &Volume,
        start: u64,
        count: u64,
    ) -> Result<&[u8], EntryError> {
        if start >= volume.total_clusters || count > volume.total_clusters - start {
            return Err(EntryError::RunOutOfRange {
                start: start as i64,
                count,
                total: volume.total_clusters,
            });
        }
        let cluster = volume.cluster_size as u64;
        // start/count are bounded by total_clusters; the byte products can
        // still exceed u64 on absurd boot-sector geometry.
        let (Some(offset), Some(len)) = (start.checked_mul(cluster), count.checked_mul(cluster))
        else {
            return Err(EntryError::RunOutOfRange {
                start: start as i64,
                count,
                total: volume.total_clusters,
            });
        };
        self.read_at(offset, len as usize)
    }
}
