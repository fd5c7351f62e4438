//! On-disk structure builders shared by the unit tests. Everything here
//! produces the little-endian byte layouts the parsers consume.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ntfs_parser::{
    Volume, ATTRIBUTE_END, ATTR_DATA, ATTR_FILE_NAME, ATTR_INDEX_ROOT,
    ATTR_STANDARD_INFORMATION,
};

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

fn utf16le(name: &str) -> Vec<u8> {
    name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn align8(v: usize) -> usize {
    (v + 7) & !7
}

/// Fixed geometry used by most tests: 512-byte sectors, 2 sectors per
/// cluster, MFT at cluster 2, 1 KiB records and index blocks.
pub fn test_volume(total_clusters: u64) -> Volume {
    Volume {
        bytes_per_sector: 512,
        sectors_per_cluster: 2,
        cluster_size: 1024,
        mft_start_cluster: 2,
        mft_record_size: 1024,
        index_record_size: 1024,
        total_clusters,
    }
}

/// A 512-byte NTFS boot sector with the given geometry. Record sizes use the
/// on-disk signed-byte encoding.
pub fn boot_sector_bytes(
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    total_sectors: u64,
    mft_cluster: u64,
    mft_size_raw: i8,
    index_size_raw: i8,
) -> Vec<u8> {
    let mut b = vec![0u8; 512];
    b[3..7].copy_from_slice(b"NTFS");
    put_u16(&mut b, 0x0B, bytes_per_sector);
    b[0x0D] = sectors_per_cluster;
    put_u64(&mut b, 0x28, total_sectors);
    put_u64(&mut b, 0x30, mft_cluster);
    b[0x40] = mft_size_raw as u8;
    b[0x44] = index_size_raw as u8;
    b[510] = 0x55;
    b[511] = 0xAA;
    b
}

fn unsigned_width(v: u64) -> usize {
    let mut n = 1;
    while n < 8 && v >= 1u64 << (n * 8) {
        n += 1;
    }
    n
}

fn signed_width(v: i64) -> usize {
    for n in 1..8usize {
        let bits = (n * 8) as u32;
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if v >= min && v <= max {
            return n;
        }
    }
    8
}

/// Encode `(absolute_start, count)` extents as an NTFS run list, deltas in
/// minimal signed width, terminated with a zero byte.
pub fn encode_runs(runs: &[(i64, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0i64;
    for &(start, count) in runs {
        let delta = start - prev;
        prev = start;
        let len_w = unsigned_width(count);
        let off_w = signed_width(delta);
        out.push(((off_w as u8) << 4) | len_w as u8);
        out.extend_from_slice(&count.to_le_bytes()[..len_w]);
        out.extend_from_slice(&delta.to_le_bytes()[..off_w]);
    }
    out.push(0);
    out
}

/// A complete resident attribute: header, optional name, inline value,
/// padded to 8 bytes.
pub fn resident_attr(type_code: u32, name: &str, flags: u16, value: &[u8]) -> Vec<u8> {
    let name_bytes = utf16le(name);
    let name_offset = 0x18;
    let value_offset = name_offset + name_bytes.len();
    let length = align8(value_offset + value.len());

    let mut a = vec![0u8; length];
    put_u32(&mut a, 0, type_code);
    put_u32(&mut a, 4, length as u32);
    a[8] = 0; // resident
    a[9] = (name_bytes.len() / 2) as u8;
    put_u16(&mut a, 10, name_offset as u16);
    put_u16(&mut a, 12, flags);
    put_u32(&mut a, 16, value.len() as u32);
    put_u16(&mut a, 20, value_offset as u16);
    a[name_offset..name_offset + name_bytes.len()].copy_from_slice(&name_bytes);
    a[value_offset..value_offset + value.len()].copy_from_slice(value);
    a
}

/// A complete non-resident attribute: header through the size fields,
/// optional name, then `runs` verbatim (callers append their own
/// terminator via `encode_runs`, or deliberately omit it).
pub fn non_resident_attr(
    type_code: u32,
    name: &str,
    flags: u16,
    data_size: u64,
    runs: &[u8],
) -> Vec<u8> {
    let name_bytes = utf16le(name);
    let name_offset = 0x40;
    let runs_offset = align8(name_offset + name_bytes.len());
    let length = align8(runs_offset + runs.len());

    let mut a = vec![0u8; length];
    put_u32(&mut a, 0, type_code);
    put_u32(&mut a, 4, length as u32);
    a[8] = 1; // non-resident
    a[9] = (name_bytes.len() / 2) as u8;
    put_u16(&mut a, 10, name_offset as u16);
    put_u16(&mut a, 12, flags);
    put_u16(&mut a, 0x20, runs_offset as u16);
    let allocated = data_size.div_ceil(1024) * 1024;
    put_u64(&mut a, 0x28, allocated);
    put_u64(&mut a, 0x30, data_size);
    put_u64(&mut a, 0x38, data_size); // initialized size
    a[name_offset..name_offset + name_bytes.len()].copy_from_slice(&name_bytes);
    a[runs_offset..runs_offset + runs.len()].copy_from_slice(runs);
    a
}

/// A $FILE_NAME attribute value (namespace Win32 unless the caller patches
/// the byte at 0x41).
pub fn file_name_value(
    parent_record: u64,
    parent_sequence: u16,
    name: &str,
    is_directory: bool,
    real_size: u64,
) -> Vec<u8> {
    let name_bytes = utf16le(name);
    let mut v = vec![0u8; 0x42 + name_bytes.len()];
    let parent_ref = (parent_record & 0x0000_FFFF_FFFF_FFFF) | ((parent_sequence as u64) << 48);
    put_u64(&mut v, 0, parent_ref);
    put_u64(&mut v, 0x28, real_size.div_ceil(1024) * 1024);
    put_u64(&mut v, 0x30, real_size);
    if is_directory {
        put_u32(&mut v, 0x38, 0x1000_0000);
    }
    v[0x40] = (name_bytes.len() / 2) as u8;
    v[0x41] = 1; // Win32 namespace
    v[0x42..].copy_from_slice(&name_bytes);
    v
}

/// A $STANDARD_INFORMATION value with all four timestamps set to `filetime`.
pub fn standard_information_value(filetime: i64) -> Vec<u8> {
    let mut v = vec![0u8; 0x30];
    for off in [0x00, 0x08, 0x10, 0x18] {
        put_u64(&mut v, off, filetime as u64);
    }
    v
}

/// Builds a 1024-byte MFT record with a valid update sequence array. The
/// check word is stamped over the last two bytes of each 512-byte sector and
/// the originals are saved into the USA, so decoding exercises the fix-up
/// path on every record.
pub struct RecordBuilder {
    record_number: u64,
    sequence: u16,
    in_use: bool,
    is_directory: bool,
    attrs: Vec<Vec<u8>>,
}

impl RecordBuilder {
    pub fn new(record_number: u64, in_use: bool, is_directory: bool) -> RecordBuilder {
        RecordBuilder {
            record_number,
            sequence: 1,
            in_use,
            is_directory,
            attrs: Vec::new(),
        }
    }

    pub fn push_attr(&mut self, attr: Vec<u8>) -> &mut RecordBuilder {
        self.attrs.push(attr);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        const RECORD_SIZE: usize = 1024;
        const USA_OFFSET: usize = 0x30;
        const USA_COUNT: usize = 3; // check word + one entry per sector
        const FIRST_ATTR: usize = 0x38;

        let mut r = vec![0u8; RECORD_SIZE];
        r[0..4].copy_from_slice(b"FILE");
        put_u16(&mut r, 4, USA_OFFSET as u16);
        put_u16(&mut r, 6, USA_COUNT as u16);
        put_u16(&mut r, 0x10, self.sequence);
        put_u16(&mut r, 0x12, 1); // hard links
        put_u16(&mut r, 0x14, FIRST_ATTR as u16);
        let mut flags = 0u16;
        if self.in_use {
            flags |= 0x01;
        }
        if self.is_directory {
            flags |= 0x02;
        }
        put_u16(&mut r, 0x16, flags);
        put_u32(&mut r, 0x1C, RECORD_SIZE as u32); // allocated size
        put_u32(&mut r, 0x2C, self.record_number as u32);

        let mut offset = FIRST_ATTR;
        for attr in &self.attrs {
            assert!(
                offset + attr.len() + 8 <= RECORD_SIZE,
                "attributes overflow the record"
            );
            r[offset..offset + attr.len()].copy_from_slice(attr);
            offset += attr.len();
        }
        put_u32(&mut r, offset, ATTRIBUTE_END);
        put_u32(&mut r, 0x18, (offset + 8) as u32); // used size

        // Fix-up: save the true sector-end words, stamp the check word.
        let check: u16 = 0x0001;
        put_u16(&mut r, USA_OFFSET, check);
        for i in 1..USA_COUNT {
            let sector_end = i * 512 - 2;
            r[USA_OFFSET + i * 2] = r[sector_end];
            r[USA_OFFSET + i * 2 + 1] = r[sector_end + 1];
            put_u16(&mut r, sector_end, check);
        }
        r
    }
}

/// One $I30 index entry carrying a $FILE_NAME key, padded to 8 bytes.
pub fn index_entry(record: u64, sequence: u16, name: &str, is_directory: bool) -> Vec<u8> {
    let key = file_name_value(0, 0, name, is_directory, 0);
    let length = align8(16 + key.len());
    let mut e = vec![0u8; length];
    let file_ref = (record & 0x0000_FFFF_FFFF_FFFF) | ((sequence as u64) << 48);
    put_u64(&mut e, 0, file_ref);
    put_u16(&mut e, 8, length as u16);
    put_u16(&mut e, 10, key.len() as u16);
    e[16..16 + key.len()].copy_from_slice(&key);
    e
}

fn terminator_entry() -> Vec<u8> {
    let mut e = vec![0u8; 16];
    put_u16(&mut e, 8, 16);
    put_u32(&mut e, 12, 0x02); // last entry
    e
}

/// An $INDEX_ROOT attribute value: 16-byte index root header, node header,
/// entry chain, terminator.
pub fn index_root_value(entries: &[Vec<u8>], has_children: bool) -> Vec<u8> {
    let chain: usize = entries.iter().map(Vec::len).sum();
    let index_length = 0x10 + chain + 16;
    let mut v = vec![0u8; 0x10 + index_length];

    put_u32(&mut v, 0x00, 0x30); // indexed attribute type: $FILE_NAME
    put_u32(&mut v, 0x04, 1); // collation: filename
    put_u32(&mut v, 0x08, 1024); // index block size
    v[0x0C] = 1; // clusters per block

    // Node header at 0x10; offsets relative to it.
    put_u32(&mut v, 0x10, 0x10); // entries offset
    put_u32(&mut v, 0x14, index_length as u32);
    put_u32(&mut v, 0x18, index_length as u32);
    if has_children {
        put_u32(&mut v, 0x1C, 0x01);
    }

    let mut offset = 0x20;
    for e in entries {
        v[offset..offset + e.len()].copy_from_slice(e);
        offset += e.len();
    }
    v[offset..offset + 16].copy_from_slice(&terminator_entry());
    v
}

/// One INDX allocation block with a valid fix-up array.
pub fn indx_block_bytes(block_size: usize, entries: &[Vec<u8>]) -> Vec<u8> {
    const USA_OFFSET: usize = 0x28;
    const ENTRIES_AT: usize = 0x40;

    let usa_count = 1 + block_size / 512;
    let mut b = vec![0u8; block_size];
    b[0..4].copy_from_slice(b"INDX");
    put_u16(&mut b, 4, USA_OFFSET as u16);
    put_u16(&mut b, 6, usa_count as u16);

    let chain: usize = entries.iter().map(Vec::len).sum();
    // Node header at 0x18; offsets relative to it.
    put_u32(&mut b, 0x18, (ENTRIES_AT - 0x18) as u32);
    put_u32(&mut b, 0x1C, (ENTRIES_AT - 0x18 + chain + 16) as u32);
    put_u32(&mut b, 0x20, (block_size - 0x18) as u32);

    let mut offset = ENTRIES_AT;
    for e in entries {
        b[offset..offset + e.len()].copy_from_slice(e);
        offset += e.len();
    }
    b[offset..offset + 16].copy_from_slice(&terminator_entry());

    let check: u16 = 0x0001;
    put_u16(&mut b, USA_OFFSET, check);
    for i in 1..usa_count {
        let sector_end = i * 512 - 2;
        b[USA_OFFSET + i * 2] = b[sector_end];
        b[USA_OFFSET + i * 2 + 1] = b[sector_end + 1];
        put_u16(&mut b, sector_end, check);
    }
    b
}

/// Unique, created output directory for filesystem-writing tests.
pub fn temp_output_dir(tag: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "ntfs_recovery_test_{}_{}_{}",
        std::process::id(),
        tag,
        n
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Shape of the synthetic volume used by the end-to-end tests. The default
/// tree is:
///
/// ```text
/// /
/// └── docs/
///     ├── a.txt   40 bytes, resident, allocated
///     ├── b.bin   3000 bytes across 3 clusters, allocated
///     └── c.tmp   deleted, resident
/// ```
#[derive(Debug, Default, Clone)]
pub struct MiniImageSpec {
    /// Add a `ghost.txt` entry in docs pointing at a zeroed MFT slot.
    pub with_dangling_entry: bool,
    /// Add a `bad.dat` entry in docs pointing at a garbage (non-FILE) slot.
    pub with_garbage_entry: bool,
    /// Add a `holes.dat` file whose run list ends in a sparse run.
    pub with_sparse_file: bool,
}

impl MiniImageSpec {
    /// First cluster of b.bin's content.
    pub const DATA_CLUSTER: u64 = 16;

    const MFT_CLUSTER: u64 = 2;
    const MFT_RECORDS: u64 = 14;
    const FILETIME_2020: i64 = 132_223_104_000_000_000;

    pub fn resident_payload() -> Vec<u8> {
        b"the quick brown fox jumps over the lazy!".to_vec()
    }

    pub fn nonresident_payload() -> Vec<u8> {
        (0..3000u32).map(|i| (i % 251) as u8).collect()
    }

    pub fn deleted_payload() -> Vec<u8> {
        b"scratch contents, unlinked but intact".to_vec()
    }
}

/// Build a 32-cluster volume image matching `MiniImageSpec`.
pub fn mini_image(spec: MiniImageSpec) -> Vec<u8> {
    const CLUSTER: usize = 1024;
    let mut image = vec![0u8; 32 * CLUSTER];

    // 64 sectors of 512 bytes, MFT at cluster 2, 1 KiB records (2^10),
    // 1-cluster index blocks.
    let boot = boot_sector_bytes(512, 2, 64, MiniImageSpec::MFT_CLUSTER, -10, 1);
    image[..512].copy_from_slice(&boot);

    let mut place = |record: u64, bytes: &[u8]| {
        let offset = MiniImageSpec::MFT_CLUSTER as usize * CLUSTER + record as usize * 1024;
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    // Record 0: $MFT itself, mapping the record array.
    let mut mft = RecordBuilder::new(0, true, false);
    mft.push_attr(resident_attr(
        ATTR_FILE_NAME,
        "",
        0,
        &file_name_value(5, 1, "$MFT", false, MiniImageSpec::MFT_RECORDS * 1024),
    ));
    mft.push_attr(non_resident_attr(
        ATTR_DATA,
        "",
        0,
        MiniImageSpec::MFT_RECORDS * 1024,
        &encode_runs(&[(
            MiniImageSpec::MFT_CLUSTER as i64,
            MiniImageSpec::MFT_RECORDS,
        )]),
    ));
    place(0, &mft.build());

    // Record 5: root directory listing docs.
    let mut root = RecordBuilder::new(5, true, true);
    root.push_attr(resident_attr(
        ATTR_INDEX_ROOT,
        "$I30",
        0,
        &index_root_value(&[index_entry(6, 1, "docs", true)], false),
    ));
    place(5, &root.build());

    // Record 6: docs directory.
    let mut listing = vec![
        index_entry(7, 1, "a.txt", false),
        index_entry(8, 1, "b.bin", false),
        index_entry(9, 1, "c.tmp", false),
    ];
    if spec.with_dangling_entry {
        listing.push(index_entry(10, 1, "ghost.txt", false));
    }
    if spec.with_garbage_entry {
        listing.push(index_entry(11, 1, "bad.dat", false));
    }
    if spec.with_sparse_file {
        listing.push(index_entry(12, 1, "holes.dat", false));
    }
    let mut docs = RecordBuilder::new(6, true, true);
    docs.push_attr(resident_attr(
        ATTR_FILE_NAME,
        "",
        0,
        &file_name_value(5, 1, "docs", true, 0),
    ));
    docs.push_attr(resident_attr(ATTR_INDEX_ROOT, "$I30", 0, &index_root_value(&listing, false)));
    place(6, &docs.build());

    // Record 7: a.txt, small resident file.
    let a_payload = MiniImageSpec::resident_payload();
    let mut a = RecordBuilder::new(7, true, false);
    a.push_attr(resident_attr(
        ATTR_STANDARD_INFORMATION,
        "",
        0,
        &standard_information_value(MiniImageSpec::FILETIME_2020),
    ));
    a.push_attr(resident_attr(
        ATTR_FILE_NAME,
        "",
        0,
        &file_name_value(6, 1, "a.txt", false, a_payload.len() as u64),
    ));
    a.push_attr(resident_attr(ATTR_DATA, "", 0, &a_payload));
    place(7, &a.build());

    // Record 8: b.bin, non-resident over 3 clusters with slack.
    let b_payload = MiniImageSpec::nonresident_payload();
    let mut b = RecordBuilder::new(8, true, false);
    b.push_attr(resident_attr(
        ATTR_STANDARD_INFORMATION,
        "",
        0,
        &standard_information_value(MiniImageSpec::FILETIME_2020),
    ));
    b.push_attr(resident_attr(
        ATTR_FILE_NAME,
        "",
        0,
        &file_name_value(6, 1, "b.bin", false, b_payload.len() as u64),
    ));
    b.push_attr(non_resident_attr(
        ATTR_DATA,
        "",
        0,
        b_payload.len() as u64,
        &encode_runs(&[(MiniImageSpec::DATA_CLUSTER as i64, 3)]),
    ));
    place(8, &b.build());

    // Record 9: c.tmp, deleted but index entry and content still intact.
    let c_payload = MiniImageSpec::deleted_payload();
    let mut c = RecordBuilder::new(9, false, false);
    c.push_attr(resident_attr(
        ATTR_FILE_NAME,
        "",
        0,
        &file_name_value(6, 1, "c.tmp", false, c_payload.len() as u64),
    ));
    c.push_attr(resident_attr(ATTR_DATA, "", 0, &c_payload));
    place(9, &c.build());

    // Record 10 stays zeroed (dangling target). Record 11 is garbage.
    if spec.with_garbage_entry {
        place(11, &[0xEEu8; 1024]);
    }

    // Record 12: holes.dat, one real cluster at 19 then a sparse run.
    if spec.with_sparse_file {
        let mut h = RecordBuilder::new(12, true, false);
        h.push_attr(resident_attr(
            ATTR_FILE_NAME,
            "",
            0,
            &file_name_value(6, 1, "holes.dat", false, 2048),
        ));
        h.push_attr(non_resident_attr(
            ATTR_DATA,
            "",
            0,
            2048,
            &[0x11, 0x01, 0x13, 0x01, 0x01, 0x00],
        ));
        place(12, &h.build());
    }

    // b.bin content.
    let data_offset = MiniImageSpec::DATA_CLUSTER as usize * CLUSTER;
    image[data_offset..data_offset + b_payload.len()].copy_from_slice(&b_payload);

    image
}
