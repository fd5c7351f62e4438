//! Directory Index Walker
//! Reconstructs parent→child name mappings from $INDEX_ROOT and
//! $INDEX_ALLOCATION ($I30) structures.

use crate::content_extractor::read_run_range;
use crate::errors::EntryError;
use crate::ntfs_parser::{
    apply_fixup, AttributePayload, DataRun, FileName, MftEntry, Volume,
};
use crate::volume_reader::VolumeReader;

const INDX_SIGNATURE: &[u8] = b"INDX";

// Index entry flags
const ENTRY_HAS_SUBNODE: u32 = 0x01;
const ENTRY_LAST: u32 = 0x02;

// Index node header flags
const NODE_HAS_CHILDREN: u32 = 0x01;

// Records below this number are reserved for volume metadata ($MFT,
// $Bitmap, $Extend and friends).
const FIRST_USER_RECORD: u64 = 24;

/// One reconstructed child of a directory. Identity among siblings is the
/// name; the reference carries the target record and its expected sequence.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub record: u64,
    pub sequence: u16,
    pub is_directory: bool,
}

/// Open view of one directory's $I30 index. Root entries are parsed eagerly
/// (the root node is small and resident); allocation blocks are visited one
/// at a time by the `Children` iterator.
pub struct DirectoryIndex<'a> {
    reader: &'a VolumeReader,
    volume: &'a Volume,
    root_entries: Vec<Result<DirectoryEntry, EntryError>>,
    alloc_runs: &'a [DataRun],
    alloc_size: u64,
    block_size: u32,
    /// Active-block bits from the $BITMAP attribute, if resident.
    block_bitmap: Option<Vec<u8>>,
    owner_record: u64,
}

impl<'a> DirectoryIndex<'a> {
    pub fn open(
        entry: &'a MftEntry,
        reader: &'a VolumeReader,
        volume: &'a Volume,
    ) -> Result<DirectoryIndex<'a>, EntryError> {
        let root_attr = entry.index_root().ok_or(EntryError::MalformedAttribute)?;
        let AttributePayload::Resident(root) = &root_attr.payload else {
            // $INDEX_ROOT is resident by definition on valid volumes.
            return Err(EntryError::MalformedAttribute);
        };
        if root.len() < 0x20 {
            return Err(EntryError::MalformedAttribute);
        }

        // Index block size at 0x08 of the $INDEX_ROOT value; fall back to the
        // boot-sector value when zeroed.
        let mut block_size = u32::from_le_bytes([root[8], root[9], root[10], root[11]]);
        if block_size == 0 || block_size % 512 != 0 {
            block_size = volume.index_record_size;
        }

        // Node header at 0x10; entry offsets are relative to it.
        let entries_offset =
            u32::from_le_bytes([root[0x10], root[0x11], root[0x12], root[0x13]]) as usize;
        let index_length =
            u32::from_le_bytes([root[0x14], root[0x15], root[0x16], root[0x17]]) as usize;
        let node_flags = u32::from_le_bytes([root[0x1C], root[0x1D], root[0x1E], root[0x1F]]);

        let base = 0x10 + entries_offset;
        let end = (0x10 + index_length).min(root.len());
        let root_entries = parse_entry_chain(root, base, end);

        let mut alloc_runs: &[DataRun] = &[];
        let mut alloc_size = 0u64;
        if node_flags & NODE_HAS_CHILDREN != 0 {
            match entry.index_allocation().map(|a| &a.payload) {
                Some(AttributePayload::NonResident { data_size, runs }) => {
                    alloc_runs = runs;
                    alloc_size = *data_size;
                }
                Some(_) => return Err(EntryError::MalformedAttribute),
                None => {
                    // Children flagged but no allocation attribute survived;
                    // walk what the root holds.
                    log::warn!(
                        "record {}: index root flags children but $INDEX_ALLOCATION is missing",
                        entry.record_number
                    );
                }
            }
        }

        let block_bitmap = entry.index_bitmap().and_then(|a| match &a.payload {
            AttributePayload::Resident(bits) => Some(bits.clone()),
            _ => None,
        });

        Ok(DirectoryIndex {
            reader,
            volume,
            root_entries,
            alloc_runs,
            alloc_size,
            block_size,
            block_bitmap,
            owner_record: entry.record_number,
        })
    }

    /// Lazy child listing: root entries first, then each active allocation
    /// block as it is reached. A block that fails to read or parse yields one
    /// error item and the walk moves to the next block.
    pub fn children(self) -> Children<'a> {
        let total_blocks = if self.block_size == 0 {
            0
        } else {
            self.alloc_size / self.block_size as u64
        };
        Children {
            reader: self.reader,
            volume: self.volume,
            root: self.root_entries.into_iter(),
            current: Vec::new().into_iter(),
            alloc_runs: self.alloc_runs,
            block_size: self.block_size,
            block_bitmap: self.block_bitmap,
            total_blocks,
            next_block: 0,
            owner_record: self.owner_record,
        }
    }
}

pub struct Children<'a> {
    reader: &'a VolumeReader,
    volume: &'a Volume,
    root: std::vec::IntoIter<Result<DirectoryEntry, EntryError>>,
    current: std::vec::IntoIter<Result<DirectoryEntry, EntryError>>,
    alloc_runs: &'a [DataRun],
    block_size: u32,
    block_bitmap: Option<Vec<u8>>,
    total_blocks: u64,
    next_block: u64,
    owner_record: u64,
}

impl<'a> Children<'a> {
    fn block_is_active(&self, block: u64) -> bool {
        match &self.block_bitmap {
            Some(bits) => {
                let byte = (block / 8) as usize;
                byte < bits.len() && bits[byte] & (1 << (block % 8)) != 0
            }
            // No bitmap survived: treat every block as active and let the
            // INDX signature check reject stale ones.
            None => true,
        }
    }
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<DirectoryEntry, EntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.root.next() {
            return Some(item);
        }

        loop {
            if let Some(item) = self.current.next() {
                return Some(item);
            }
            if self.next_block >= self.total_blocks {
                return None;
            }

            let block = self.next_block;
            self.next_block += 1;
            if !self.block_is_active(block) {
                continue;
            }

            let offset = block * self.block_size as u64;
            let raw = match read_run_range(
                self.reader,
                self.volume,
                self.alloc_runs,
                offset,
                self.block_size as usize,
            ) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!(
                        "record {}: index block {} unreadable: {}",
                        self.owner_record,
                        block,
                        e
                    );
                    return Some(Err(e));
                }
            };

            match parse_indx_block(raw, self.volume.bytes_per_sector, self.owner_record) {
                Ok(entries) => self.current = entries.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Parse one INDX allocation block: signature check, fix-up, then the entry
/// chain of its node header.
fn parse_indx_block(
    mut data: Vec<u8>,
    bytes_per_sector: u16,
    owner_record: u64,
) -> Result<Vec<Result<DirectoryEntry, EntryError>>, EntryError> {
    if data.len() < 0x28 || &data[0..4] != INDX_SIGNATURE {
        return Err(EntryError::MalformedAttribute);
    }

    let usa_offset = u16::from_le_bytes([data[4], data[5]]) as usize;
    let usa_count = u16::from_le_bytes([data[6], data[7]]) as usize;
    apply_fixup(
        &mut data,
        usa_offset,
        usa_count,
        bytes_per_sector as usize,
        "INDX",
        owner_record,
    );

    // Node header at 0x18; entry offsets relative to it.
    let entries_offset =
        u32::from_le_bytes([data[0x18], data[0x19], data[0x1A], data[0x1B]]) as usize;
    let index_length =
        u32::from_le_bytes([data[0x1C], data[0x1D], data[0x1E], data[0x1F]]) as usize;

    let base = 0x18 + entries_offset;
    let end = (0x18 + index_length).min(data.len());
    Ok(parse_entry_chain(&data, base, end))
}

/// Walk a chain of index entries. Structural exclusions happen here: the
/// terminator, DOS-namespace duplicates, self entries and system metadata
/// files are never yielded. A keyed entry whose $FILE_NAME does not parse is
/// yielded as `MissingFileName` so the caller can count it.
fn parse_entry_chain(
    data: &[u8],
    mut offset: usize,
    end: usize,
) -> Vec<Result<DirectoryEntry, EntryError>> {
    let mut entries = Vec::new();
    let end = end.min(data.len());

    while offset + 16 <= end {
        let file_ref = u64::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let entry_length = u16::from_le_bytes([data[offset + 8], data[offset + 9]]) as usize;
        let key_length = u16::from_le_bytes([data[offset + 10], data[offset + 11]]) as usize;
        let flags = u32::from_le_bytes([
            data[offset + 12],
            data[offset + 13],
            data[offset + 14],
            data[offset + 15],
        ]);

        if entry_length < 16 || offset + entry_length > end {
            break;
        }

        // Intermediate nodes carry subnode pointers; block enumeration covers
        // their contents, so the flag needs no descent here.
        let _ = flags & ENTRY_HAS_SUBNODE;

        if key_length > 0 {
            if offset + 16 + key_length <= end {
                match FileName::parse(&data[offset + 16..offset + 16 + key_length]) {
                    Some(fname) => {
                        let record = file_ref & 0x0000_FFFF_FFFF_FFFF;
                        // $-prefixed names are only system metadata when they
                        // sit in the reserved record range; users may create
                        // files like `$budget.xlsx`.
                        let is_metadata =
                            fname.name.starts_with('$') && record < FIRST_USER_RECORD;
                        if !fname.is_dos_name() && fname.name != "." && !is_metadata {
                            entries.push(Ok(DirectoryEntry {
                                name: fname.name.clone(),
                                record,
                                sequence: (file_ref >> 48) as u16,
                                is_directory: fname.is_directory(),
                            }));
                        }
                    }
                    None => entries.push(Err(EntryError::MissingFileName)),
                }
            } else {
                entries.push(Err(EntryError::MissingFileName));
            }
        }

        if flags & ENTRY_LAST != 0 {
            break;
        }
        offset += entry_length;
    }

    entries
}
