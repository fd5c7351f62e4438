//! NTFS structural parser
//! Boot sector geometry, MFT record decoding, attribute resolution and
//! data-run lists.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

use crate::errors::{EntryError, VolumeError};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const FILE_SIGNATURE: &[u8] = b"FILE";
pub const ATTRIBUTE_END: u32 = 0xFFFF_FFFF;

/// Record number of the volume root directory.
pub const ROOT_RECORD: u64 = 5;

// Attribute type codes
pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_BITMAP: u32 = 0xB0;

// Attribute flags (offset 0x0C of the attribute header)
pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

// MFT record flags
const RECORD_IN_USE: u16 = 0x01;
const RECORD_IS_DIRECTORY: u16 = 0x02;

// $FILE_NAME flags
const FILE_NAME_FLAG_DIRECTORY: u32 = 0x1000_0000;

/// Volume geometry derived from the boot sector. Immutable for the life of
/// a recovery session.
#[derive(Debug, Clone)]
pub struct Volume {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub cluster_size: u32,
    pub mft_start_cluster: u64,
    pub mft_record_size: u32,
    pub index_record_size: u32,
    pub total_clusters: u64,
}

/// Resolve the signed-byte size encoding used for MFT and index records:
/// positive means a cluster count, negative means 2^(-v) bytes. `None` for
/// exponents outside u32 range or a zero byte; corrupt boot sectors carry
/// arbitrary values here.
fn decode_record_size(raw: i8, cluster_size: u32) -> Option<u32> {
    if raw > 0 {
        (raw as u32).checked_mul(cluster_size)
    } else {
        let exponent = raw.checked_neg()? as u32;
        if exponent == 0 || exponent > 31 {
            return None;
        }
        Some(1u32 << exponent)
    }
}

fn is_power_of_two(v: u64) -> bool {
    v != 0 && v & (v - 1) == 0
}

/// Parse the NTFS boot sector (first 512 bytes of the volume).
pub fn parse_boot_sector(data: &[u8]) -> Result<Volume, VolumeError> {
    if data.len() < BOOT_SECTOR_SIZE {
        return Err(VolumeError::InvalidGeometry(format!(
            "boot sector is {} bytes, need {}",
            data.len(),
            BOOT_SECTOR_SIZE
        )));
    }

    // OEM signature "NTFS" at offset 3
    if &data[3..7] != b"NTFS" {
        return Err(VolumeError::NotNtfs);
    }

    let mut cursor = Cursor::new(data);
    let read_err =
        |_| VolumeError::InvalidGeometry("boot sector field read out of bounds".to_string());

    cursor.seek(SeekFrom::Start(0x0B)).map_err(read_err)?;
    let bytes_per_sector = cursor.read_u16::<LittleEndian>().map_err(read_err)?;
    let sectors_per_cluster = cursor.read_u8().map_err(read_err)?;

    cursor.seek(SeekFrom::Start(0x28)).map_err(read_err)?;
    let total_sectors = cursor.read_u64::<LittleEndian>().map_err(read_err)?;
    let mft_start_cluster = cursor.read_u64::<LittleEndian>().map_err(read_err)?;

    cursor.seek(SeekFrom::Start(0x40)).map_err(read_err)?;
    let mft_size_raw = cursor.read_i8().map_err(read_err)?;
    cursor.seek(SeekFrom::Start(0x44)).map_err(read_err)?;
    let index_size_raw = cursor.read_i8().map_err(read_err)?;

    if !is_power_of_two(bytes_per_sector as u64) || !is_power_of_two(sectors_per_cluster as u64) {
        return Err(VolumeError::InvalidGeometry(format!(
            "sector size {} / sectors per cluster {}",
            bytes_per_sector, sectors_per_cluster
        )));
    }

    let cluster_size = bytes_per_sector as u32 * sectors_per_cluster as u32;
    let mft_record_size = decode_record_size(mft_size_raw, cluster_size).ok_or_else(|| {
        VolumeError::InvalidGeometry(format!("MFT record size byte {:#04x}", mft_size_raw as u8))
    })?;
    let index_record_size = decode_record_size(index_size_raw, cluster_size).ok_or_else(|| {
        VolumeError::InvalidGeometry(format!(
            "index record size byte {:#04x}",
            index_size_raw as u8
        ))
    })?;

    if !is_power_of_two(mft_record_size as u64) {
        return Err(VolumeError::InvalidGeometry(format!(
            "MFT record size {}",
            mft_record_size
        )));
    }
    if !is_power_of_two(index_record_size as u64) {
        return Err(VolumeError::InvalidGeometry(format!(
            "index record size {}",
            index_record_size
        )));
    }

    let total_clusters = total_sectors / sectors_per_cluster as u64;
    if total_clusters == 0 {
        return Err(VolumeError::InvalidGeometry("zero total clusters".to_string()));
    }

    Ok(Volume {
        bytes_per_sector,
        sectors_per_cluster,
        cluster_size,
        mft_start_cluster,
        mft_record_size,
        index_record_size,
        total_clusters,
    })
}

/// One contiguous cluster extent of a non-resident attribute. Offsets in the
/// on-disk run list are deltas; `start_cluster` here is already absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRun {
    pub start_cluster: i64,
    pub cluster_count: u64,
    /// Run with no on-disk backing (zero offset width in the run list).
    pub is_sparse: bool,
}

#[derive(Debug, Clone)]
pub enum AttributePayload {
    /// Payload stored inline in the MFT record.
    Resident(Vec<u8>),
    /// Payload stored in external clusters described by the run list.
    NonResident { data_size: u64, runs: Vec<DataRun> },
    /// Header was readable but the payload could not be resolved. Kept so the
    /// attribute is skipped deliberately, not dropped.
    Malformed,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub type_code: u32,
    /// Stream name; empty for the main unnamed stream.
    pub name: String,
    pub flags: u16,
    pub payload: AttributePayload,
}

impl Attribute {
    pub fn data_size(&self) -> u64 {
        match &self.payload {
            AttributePayload::Resident(data) => data.len() as u64,
            AttributePayload::NonResident { data_size, .. } => *data_size,
            AttributePayload::Malformed => 0,
        }
    }

    /// Encoding the engine will not decode; the owning file is reported in
    /// degraded mode instead of written corrupt.
    pub fn unsupported_encoding(&self) -> Option<&'static str> {
        if self.flags & ATTR_FLAG_COMPRESSED != 0 {
            Some("compressed")
        } else if self.flags & ATTR_FLAG_ENCRYPTED != 0 {
            Some("encrypted")
        } else {
            None
        }
    }
}

/// One decoded MFT record. Never mutated after decode.
#[derive(Debug, Clone)]
pub struct MftEntry {
    pub record_number: u64,
    pub sequence: u16,
    pub hard_link_count: u16,
    pub is_in_use: bool,
    pub is_directory: bool,
    pub attributes: Vec<Attribute>,
}

impl MftEntry {
    pub fn attributes_of(&self, type_code: u32) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.type_code == type_code)
    }

    /// The main unnamed $DATA stream.
    pub fn data_attribute(&self) -> Option<&Attribute> {
        self.attributes_of(ATTR_DATA).find(|a| a.name.is_empty())
    }

    pub fn index_root(&self) -> Option<&Attribute> {
        self.attributes_of(ATTR_INDEX_ROOT).next()
    }

    pub fn index_allocation(&self) -> Option<&Attribute> {
        self.attributes_of(ATTR_INDEX_ALLOCATION).next()
    }

    pub fn index_bitmap(&self) -> Option<&Attribute> {
        self.attributes_of(ATTR_BITMAP).next()
    }

    /// Best $FILE_NAME value: prefer non-DOS namespaces, then the longest
    /// name (a record carries one $FILE_NAME per namespace).
    pub fn best_file_name(&self) -> Option<FileName> {
        let mut best: Option<FileName> = None;
        for attr in self.attributes_of(ATTR_FILE_NAME) {
            let AttributePayload::Resident(value) = &attr.payload else {
                continue;
            };
            let Some(fname) = FileName::parse(value) else {
                continue;
            };
            if fname.is_dos_name() {
                continue;
            }
            match &best {
                Some(b) if b.name.len() >= fname.name.len() => {}
                _ => best = Some(fname),
            }
        }
        best
    }

    pub fn standard_information(&self) -> Option<StandardInformation> {
        let attr = self.attributes_of(ATTR_STANDARD_INFORMATION).next()?;
        let AttributePayload::Resident(value) = &attr.payload else {
            return None;
        };
        StandardInformation::parse(value)
    }
}

/// Decode one fixed-size MFT record. `InvalidRecord` when the FILE magic is
/// absent; skip-level, the caller moves on.
pub fn decode_record(
    data: &[u8],
    record_number: u64,
    bytes_per_sector: u16,
) -> Result<MftEntry, EntryError> {
    if data.len() < 0x2A || &data[0..4] != FILE_SIGNATURE {
        return Err(EntryError::InvalidRecord(record_number));
    }

    let usa_offset = u16::from_le_bytes([data[4], data[5]]) as usize;
    let usa_count = u16::from_le_bytes([data[6], data[7]]) as usize;

    let mut fixed = data.to_vec();
    apply_fixup(
        &mut fixed,
        usa_offset,
        usa_count,
        bytes_per_sector as usize,
        "FILE",
        record_number,
    );

    let sequence = u16::from_le_bytes([fixed[0x10], fixed[0x11]]);
    let hard_link_count = u16::from_le_bytes([fixed[0x12], fixed[0x13]]);
    let first_attr_offset = u16::from_le_bytes([fixed[0x14], fixed[0x15]]) as usize;
    let flags = u16::from_le_bytes([fixed[0x16], fixed[0x17]]);
    let used_size =
        u32::from_le_bytes([fixed[0x18], fixed[0x19], fixed[0x1A], fixed[0x1B]]) as usize;

    let end = used_size.min(fixed.len());
    let mut attributes = Vec::new();
    let mut offset = first_attr_offset;

    while offset + 8 <= end {
        let type_code = u32::from_le_bytes([
            fixed[offset],
            fixed[offset + 1],
            fixed[offset + 2],
            fixed[offset + 3],
        ]);
        if type_code == ATTRIBUTE_END || type_code == 0 {
            break;
        }

        let length = u32::from_le_bytes([
            fixed[offset + 4],
            fixed[offset + 5],
            fixed[offset + 6],
            fixed[offset + 7],
        ]) as usize;
        if length < 0x10 || offset + length > fixed.len() {
            log::warn!(
                "record {}: attribute 0x{:x} at 0x{:x} has bad length {}, stopping attribute walk",
                record_number,
                type_code,
                offset,
                length
            );
            break;
        }

        match resolve_attribute(&fixed[offset..offset + length]) {
            Ok(attr) => attributes.push(attr),
            Err(e) => {
                // Keep the slot so callers skip this attribute deliberately;
                // sibling attributes still resolve.
                log::warn!(
                    "record {}: attribute 0x{:x} unusable: {}",
                    record_number,
                    type_code,
                    e
                );
                attributes.push(Attribute {
                    type_code,
                    name: String::new(),
                    flags: 0,
                    payload: AttributePayload::Malformed,
                });
            }
        }

        offset += length;
    }

    Ok(MftEntry {
        record_number,
        sequence,
        hard_link_count,
        is_in_use: flags & RECORD_IN_USE != 0,
        is_directory: flags & RECORD_IS_DIRECTORY != 0,
        attributes,
    })
}

/// Restore the sector-end bytes saved in the update sequence array. A
/// mismatched check word is logged and left in place; parsing continues
/// best-effort on the remainder.
pub(crate) fn apply_fixup(
    data: &mut [u8],
    usa_offset: usize,
    usa_count: usize,
    sector_size: usize,
    kind: &str,
    record_number: u64,
) {
    if usa_count < 2 || sector_size < 2 || usa_offset + usa_count * 2 > data.len() {
        return;
    }

    let check = u16::from_le_bytes([data[usa_offset], data[usa_offset + 1]]);

    for i in 1..usa_count {
        let sector_end = i * sector_size - 2;
        if sector_end + 1 >= data.len() {
            break;
        }
        let current = u16::from_le_bytes([data[sector_end], data[sector_end + 1]]);
        if current != check {
            log::warn!(
                "{} record {}: fixup mismatch at sector {} (found {:#06x}, expected {:#06x})",
                kind,
                record_number,
                i,
                current,
                check
            );
            continue;
        }
        data[sector_end] = data[usa_offset + i * 2];
        data[sector_end + 1] = data[usa_offset + i * 2 + 1];
    }
}

/// Classify one attribute as resident or non-resident and resolve its
/// payload. `MalformedDataRuns` when a non-resident run list has no
/// terminator inside the attribute bounds.
pub fn resolve_attribute(raw: &[u8]) -> Result<Attribute, EntryError> {
    if raw.len() < 0x10 {
        return Err(EntryError::MalformedAttribute);
    }

    let type_code = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let non_resident = raw[8];
    let name_length = raw[9] as usize;
    let name_offset = u16::from_le_bytes([raw[10], raw[11]]) as usize;
    let flags = u16::from_le_bytes([raw[12], raw[13]]);

    let name = if name_length > 0 {
        if name_offset + name_length * 2 > raw.len() {
            return Err(EntryError::MalformedAttribute);
        }
        let units: Vec<u16> = (0..name_length)
            .map(|i| u16::from_le_bytes([raw[name_offset + i * 2], raw[name_offset + i * 2 + 1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::new()
    };

    let payload = if non_resident == 0 {
        if raw.len() < 0x18 {
            return Err(EntryError::MalformedAttribute);
        }
        let value_length = u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]) as usize;
        let value_offset = u16::from_le_bytes([raw[20], raw[21]]) as usize;
        if value_offset + value_length > raw.len() {
            return Err(EntryError::MalformedAttribute);
        }
        AttributePayload::Resident(raw[value_offset..value_offset + value_length].to_vec())
    } else {
        if raw.len() < 0x40 {
            return Err(EntryError::MalformedAttribute);
        }
        let runs_offset = u16::from_le_bytes([raw[0x20], raw[0x21]]) as usize;
        let data_size = u64::from_le_bytes([
            raw[0x30], raw[0x31], raw[0x32], raw[0x33], raw[0x34], raw[0x35], raw[0x36], raw[0x37],
        ]);
        if runs_offset >= raw.len() {
            return Err(EntryError::MalformedAttribute);
        }
        let runs = decode_data_runs(&raw[runs_offset..])?;
        AttributePayload::NonResident { data_size, runs }
    };

    Ok(Attribute {
        type_code,
        name,
        flags,
        payload,
    })
}

/// Decode a data-run byte stream into absolute cluster extents.
///
/// Each run is a header byte (low nibble: length width, high nibble: offset
/// width) followed by the two little-endian variable-width integers. Offsets
/// after the first run are signed deltas from the previous run's start; a
/// zero offset width marks a sparse run. The list must end with a zero byte.
pub fn decode_data_runs(data: &[u8]) -> Result<Vec<DataRun>, EntryError> {
    let mut runs = Vec::new();
    let mut offset = 0usize;
    let mut prev_start: i64 = 0;

    loop {
        if offset >= data.len() {
            return Err(EntryError::MalformedDataRuns);
        }
        let header = data[offset];
        if header == 0 {
            return Ok(runs);
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = ((header >> 4) & 0x0F) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return Err(EntryError::MalformedDataRuns);
        }
        if offset + 1 + length_size + offset_size > data.len() {
            return Err(EntryError::MalformedDataRuns);
        }

        let mut cluster_count: u64 = 0;
        for i in 0..length_size {
            cluster_count |= (data[offset + 1 + i] as u64) << (i * 8);
        }
        if cluster_count == 0 {
            return Err(EntryError::MalformedDataRuns);
        }

        if offset_size == 0 {
            // Sparse run: no on-disk clusters, previous start carries over.
            runs.push(DataRun {
                start_cluster: 0,
                cluster_count,
                is_sparse: true,
            });
        } else {
            let mut delta: i64 = 0;
            for i in 0..offset_size {
                delta |= (data[offset + 1 + length_size + i] as i64) << (i * 8);
            }
            // Sign-extend from the top bit of the last offset byte.
            if offset_size < 8 && data[offset + length_size + offset_size] & 0x80 != 0 {
                for i in offset_size..8 {
                    delta |= 0xFFi64 << (i * 8);
                }
            }
            let start = prev_start + delta;
            prev_start = start;
            runs.push(DataRun {
                start_cluster: start,
                cluster_count,
                is_sparse: false,
            });
        }

        offset += 1 + length_size + offset_size;
    }
}

/// Parsed $FILE_NAME attribute value.
#[derive(Debug, Clone)]
pub struct FileName {
    pub parent_record: u64,
    pub parent_sequence: u16,
    pub allocated_size: u64,
    pub real_size: u64,
    pub flags: u32,
    pub namespace: u8,
    pub name: String,
}

impl FileName {
    pub fn parse(value: &[u8]) -> Option<FileName> {
        if value.len() < 0x42 {
            return None;
        }

        let parent_ref = u64::from_le_bytes([
            value[0], value[1], value[2], value[3], value[4], value[5], value[6], value[7],
        ]);
        let allocated_size = u64::from_le_bytes([
            value[0x28], value[0x29], value[0x2A], value[0x2B],
            value[0x2C], value[0x2D], value[0x2E], value[0x2F],
        ]);
        let real_size = u64::from_le_bytes([
            value[0x30], value[0x31], value[0x32], value[0x33],
            value[0x34], value[0x35], value[0x36], value[0x37],
        ]);
        let flags = u32::from_le_bytes([value[0x38], value[0x39], value[0x3A], value[0x3B]]);
        let name_length = value[0x40] as usize;
        let namespace = value[0x41];

        if 0x42 + name_length * 2 > value.len() {
            return None;
        }
        let units: Vec<u16> = (0..name_length)
            .map(|i| u16::from_le_bytes([value[0x42 + i * 2], value[0x42 + i * 2 + 1]]))
            .collect();

        Some(FileName {
            parent_record: parent_ref & 0x0000_FFFF_FFFF_FFFF,
            parent_sequence: (parent_ref >> 48) as u16,
            allocated_size,
            real_size,
            flags,
            namespace,
            name: String::from_utf16_lossy(&units),
        })
    }

    /// DOS 8.3 short-name duplicate (namespace 2).
    pub fn is_dos_name(&self) -> bool {
        self.namespace == 2
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FILE_NAME_FLAG_DIRECTORY != 0
    }
}

/// Timestamps from $STANDARD_INFORMATION, converted to Unix seconds.
#[derive(Debug, Clone, Copy)]
pub struct StandardInformation {
    pub created: i64,
    pub modified: i64,
    pub accessed: i64,
}

impl StandardInformation {
    pub fn parse(value: &[u8]) -> Option<StandardInformation> {
        if value.len() < 0x20 {
            return None;
        }
        let read = |off: usize| {
            i64::from_le_bytes([
                value[off], value[off + 1], value[off + 2], value[off + 3],
                value[off + 4], value[off + 5], value[off + 6], value[off + 7],
            ])
        };
        Some(StandardInformation {
            created: filetime_to_unix(read(0x00)),
            modified: filetime_to_unix(read(0x08)),
            accessed: filetime_to_unix(read(0x18)),
        })
    }
}

/// Convert Windows FILETIME (100ns ticks since 1601) to Unix seconds.
pub fn filetime_to_unix(ft: i64) -> i64 {
    if ft <= 0 {
        return 0;
    }
    (ft / 10_000_000) - 11_644_473_600
}
