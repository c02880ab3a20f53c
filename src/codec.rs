//! Binary persistence for [`VersionMap`].
//!
//! Layout, all integers little-endian and all offsets absolute:
//!
//! ```text
//! header (64 bytes)
//!   magic [8] | format u32 | latest version u32 | block size u32 | version count u32
//!   file size u64 | block count u64 | layouts offset u64 | timestamps offset u64 | index offset u64
//! layout table, one record per version
//!   version u32 | entry count u64 | stored count u64
//!   entries (version u32, slot u32) * entry count
//!   stored hashes [32] * stored count
//! timestamp table: (seconds i64, nanoseconds u32) per version
//! offset index: absolute offset u64 of each layout record
//! trailer: BLAKE3 of every preceding byte
//! ```
//!
//! Saves are staged next to the target and renamed into place.

use crate::hash::{ContentHash, HASH_SIZE};
use crate::version_map::{BlockLocation, Geometry, VersionMap, VersionRecord};
use crate::{Error, Result};
use chrono::{TimeZone, Utc};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MAGIC: [u8; 8] = *b"BLKMAP\0\x01";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;

const NO_VERSION: u32 = u32::MAX;
const RECORD_HEADER_SIZE: usize = 4 + 8 + 8;
const ENTRY_SIZE: usize = 8;
const TIMESTAMP_SIZE: usize = 12;
const INDEX_ENTRY_SIZE: usize = 8;
const CHECKSUM_SIZE: usize = blake3::OUT_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    latest_version: u32,
    block_size: u32,
    version_count: u32,
    file_size: u64,
    block_count: u64,
    layouts_offset: u64,
    timestamps_offset: u64,
    index_offset: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&MAGIC);
        out[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[12..16].copy_from_slice(&self.latest_version.to_le_bytes());
        out[16..20].copy_from_slice(&self.block_size.to_le_bytes());
        out[20..24].copy_from_slice(&self.version_count.to_le_bytes());
        out[24..32].copy_from_slice(&self.file_size.to_le_bytes());
        out[32..40].copy_from_slice(&self.block_count.to_le_bytes());
        out[40..48].copy_from_slice(&self.layouts_offset.to_le_bytes());
        out[48..56].copy_from_slice(&self.timestamps_offset.to_le_bytes());
        out[56..64].copy_from_slice(&self.index_offset.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        if reader.take(8)? != MAGIC {
            return Err(Error::format("bad magic"));
        }
        let format = reader.u32()?;
        if format != FORMAT_VERSION {
            return Err(Error::format(format!(
                "unsupported format version {} (expected {})",
                format, FORMAT_VERSION
            )));
        }
        Ok(Self {
            latest_version: reader.u32()?,
            block_size: reader.u32()?,
            version_count: reader.u32()?,
            file_size: reader.u64()?,
            block_count: reader.u64()?,
            layouts_offset: reader.u64()?,
            timestamps_offset: reader.u64()?,
            index_offset: reader.u64()?,
        })
    }

    fn geometry(&self) -> Option<Geometry> {
        (self.version_count > 0).then_some(Geometry {
            block_size: self.block_size,
            file_size: self.file_size,
            block_count: self.block_count,
        })
    }
}

/// Bounds-checked cursor over an in-memory map file
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at(bytes: &'a [u8], offset: u64) -> Result<Self> {
        let pos = usize::try_from(offset)
            .ok()
            .filter(|&pos| pos <= bytes.len())
            .ok_or_else(|| Error::format(format!("offset {} is out of range", offset)))?;
        Ok(Self { bytes, pos })
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::format(format!("unexpected end of data at offset {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Check that `count` items of `size` bytes remain, so a corrupt count
    /// fails before anything is allocated for it
    fn ensure(&self, count: u64, size: usize) -> Result<usize> {
        count
            .checked_mul(size as u64)
            .filter(|&needed| needed <= (self.bytes.len() - self.pos) as u64)
            .map(|_| count as usize)
            .ok_or_else(|| {
                Error::format(format!(
                    "{} records of {} bytes do not fit at offset {}",
                    count, size, self.pos
                ))
            })
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn hash(&mut self) -> Result<ContentHash> {
        let mut buf = [0u8; HASH_SIZE];
        buf.copy_from_slice(self.take(HASH_SIZE)?);
        Ok(ContentHash(buf))
    }
}

fn encode_record(record: &VersionRecord, out: &mut Vec<u8>) {
    out.extend_from_slice(&record.version.to_le_bytes());
    out.extend_from_slice(&(record.layout.len() as u64).to_le_bytes());
    out.extend_from_slice(&(record.stored.len() as u64).to_le_bytes());
    for location in &record.layout {
        out.extend_from_slice(&location.version.to_le_bytes());
        out.extend_from_slice(&location.slot.to_le_bytes());
    }
    for hash in &record.stored {
        out.extend_from_slice(hash.as_bytes());
    }
}

/// Record header plus layout; stored hashes are left unread
fn decode_layout(reader: &mut Reader<'_>, block_count: u64) -> Result<(u32, Vec<BlockLocation>, u64)> {
    let version = reader.u32()?;
    let entry_count = reader.u64()?;
    let stored_count = reader.u64()?;

    if entry_count != block_count {
        return Err(Error::format(format!(
            "version {} has {} layout entries, expected {}",
            version, entry_count, block_count
        )));
    }

    let entries = reader.ensure(entry_count, ENTRY_SIZE)?;
    let mut layout = Vec::with_capacity(entries);
    for _ in 0..entries {
        let location_version = reader.u32()?;
        let slot = reader.u32()?;
        layout.push(BlockLocation::new(location_version, slot));
    }

    Ok((version, layout, stored_count))
}

/// Serialize a map. Identical maps always produce identical bytes.
pub fn encode(map: &VersionMap) -> Vec<u8> {
    let versions = map.versions();
    let geometry = map.geometry().unwrap_or_default();

    let body: usize = versions
        .iter()
        .map(|r| {
            RECORD_HEADER_SIZE
                + r.layout.len() * ENTRY_SIZE
                + r.stored.len() * HASH_SIZE
                + TIMESTAMP_SIZE
                + INDEX_ENTRY_SIZE
        })
        .sum();
    let mut out = Vec::with_capacity(HEADER_SIZE + body + CHECKSUM_SIZE);
    out.resize(HEADER_SIZE, 0);

    let layouts_offset = out.len() as u64;
    let mut record_offsets = Vec::with_capacity(versions.len());
    for record in versions {
        record_offsets.push(out.len() as u64);
        encode_record(record, &mut out);
    }

    let timestamps_offset = out.len() as u64;
    for record in versions {
        out.extend_from_slice(&record.created.timestamp().to_le_bytes());
        out.extend_from_slice(&record.created.timestamp_subsec_nanos().to_le_bytes());
    }

    let index_offset = out.len() as u64;
    for offset in &record_offsets {
        out.extend_from_slice(&offset.to_le_bytes());
    }

    let header = Header {
        latest_version: map.current_version().unwrap_or(NO_VERSION),
        block_size: geometry.block_size,
        version_count: versions.len() as u32,
        file_size: geometry.file_size,
        block_count: geometry.block_count,
        layouts_offset,
        timestamps_offset,
        index_offset,
    };
    out[..HEADER_SIZE].copy_from_slice(&header.encode());

    let checksum = blake3::hash(&out);
    out.extend_from_slice(checksum.as_bytes());
    out
}

/// Parse and validate a serialized map
pub fn decode(bytes: &[u8]) -> Result<VersionMap> {
    if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(Error::format(format!(
            "file is {} bytes, too short for a map",
            bytes.len()
        )));
    }

    let body_end = bytes.len() - CHECKSUM_SIZE;
    let (body, trailer) = bytes.split_at(body_end);
    if blake3::hash(body).as_bytes() != trailer {
        return Err(Error::format("checksum mismatch"));
    }

    let header = Header::decode(&body[..HEADER_SIZE])?;
    let count = header.version_count;
    let expected_latest = count.checked_sub(1).unwrap_or(NO_VERSION);
    if header.latest_version != expected_latest {
        return Err(Error::format(format!(
            "latest version {} disagrees with version count {}",
            header.latest_version, count
        )));
    }
    if header.layouts_offset != HEADER_SIZE as u64 {
        return Err(Error::format(format!(
            "layout table at offset {}, expected {}",
            header.layouts_offset, HEADER_SIZE
        )));
    }

    let mut reader = Reader::at(body, header.layouts_offset)?;
    let mut record_offsets = Vec::new();
    let mut layouts = Vec::new();
    for _ in 0..count {
        record_offsets.push(reader.position());
        let (version, layout, stored_count) = decode_layout(&mut reader, header.block_count)?;
        let stored_count = reader.ensure(stored_count, HASH_SIZE)?;
        let stored = (0..stored_count)
            .map(|_| reader.hash())
            .collect::<Result<Vec<_>>>()?;
        layouts.push((version, layout, stored));
    }

    if reader.position() != header.timestamps_offset {
        return Err(Error::format(format!(
            "declared {} versions but layout records end at offset {}, not at the timestamp table ({})",
            count,
            reader.position(),
            header.timestamps_offset
        )));
    }

    let mut timestamps = Vec::with_capacity(reader.ensure(count as u64, TIMESTAMP_SIZE)?);
    for version in 0..count {
        let seconds = reader.i64()?;
        let nanos = reader.u32()?;
        let created = Utc
            .timestamp_opt(seconds, nanos)
            .single()
            .ok_or_else(|| Error::format(format!("version {} has an invalid timestamp", version)))?;
        timestamps.push(created);
    }

    if reader.position() != header.index_offset {
        return Err(Error::format(format!(
            "timestamp table ends at offset {}, offset index declared at {}",
            reader.position(),
            header.index_offset
        )));
    }

    for (version, expected) in record_offsets.iter().enumerate() {
        let offset = reader.u64()?;
        if offset != *expected {
            return Err(Error::format(format!(
                "offset index points version {} at {}, record is at {}",
                version, offset, expected
            )));
        }
    }

    if reader.position() != body_end as u64 {
        return Err(Error::format(format!(
            "{} trailing bytes after the offset index",
            body_end as u64 - reader.position()
        )));
    }

    let records = layouts
        .into_iter()
        .zip(timestamps)
        .map(|((version, layout, stored), created)| VersionRecord {
            version,
            created,
            layout,
            stored,
        })
        .collect();

    VersionMap::from_records(header.geometry(), records)
}

pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` through a staging file and an atomic rename.
///
/// A crash before the rename leaves any previous file at `path` untouched.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let staging = staging_path(path);

    let staged = File::create(&staging).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = staged.and_then(|_| fs::rename(&staging, path)) {
        let _ = fs::remove_file(&staging);
        return Err(Error::Io(e));
    }

    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!("Failed to sync directory {}: {}", parent.display(), e);
        }
    }

    Ok(())
}

/// Read one version's layout through the offset index, without decoding
/// the rest of the file.
///
/// The file checksum is not verified; use [`VersionMap::from_file`] for a
/// fully validated load.
pub fn read_layout<P: AsRef<Path>>(path: P, version: u32) -> Result<Vec<BlockLocation>> {
    let mut file = File::open(path.as_ref())?;
    let file_len = file.metadata()?.len();

    let mut header_bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    let header = Header::decode(&header_bytes)?;

    if version >= header.version_count {
        return Err(Error::invalid_input(format!(
            "version {} does not exist (map holds {})",
            version, header.version_count
        )));
    }

    let index_entry = header
        .index_offset
        .checked_add(u64::from(version) * INDEX_ENTRY_SIZE as u64)
        .filter(|&entry| entry.saturating_add(INDEX_ENTRY_SIZE as u64) <= file_len)
        .ok_or_else(|| Error::format("offset index is out of range"))?;
    file.seek(SeekFrom::Start(index_entry))?;
    let mut offset_bytes = [0u8; 8];
    file.read_exact(&mut offset_bytes)?;
    let record_offset = u64::from_le_bytes(offset_bytes);

    let record_len = header
        .block_count
        .checked_mul(ENTRY_SIZE as u64)
        .and_then(|entries| entries.checked_add(RECORD_HEADER_SIZE as u64))
        .filter(|&len| {
            record_offset >= HEADER_SIZE as u64 && record_offset.saturating_add(len) <= file_len
        })
        .ok_or_else(|| {
            Error::format(format!(
                "layout record for version {} at offset {} is out of range",
                version, record_offset
            ))
        })?;
    file.seek(SeekFrom::Start(record_offset))?;
    let mut record = vec![0u8; record_len as usize];
    file.read_exact(&mut record)?;

    let mut reader = Reader::new(&record);
    let (tagged, layout, _) = decode_layout(&mut reader, header.block_count)?;
    if tagged != version {
        return Err(Error::format(format!(
            "offset index entry {} points at the record of version {}",
            version, tagged
        )));
    }
    Ok(layout)
}

impl VersionMap {
    /// Persist the map, replacing any previous file at `path` atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = encode(self);
        write_atomic(path, &bytes)?;
        info!(
            "Saved version map to {} ({} versions, {} bytes)",
            path.display(),
            self.version_count(),
            bytes.len()
        );
        Ok(())
    }

    /// Load a map from `path`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let map = decode(&bytes)?;
        info!(
            "Loaded version map from {} ({} versions, {} unique blocks)",
            path.display(),
            map.version_count(),
            map.unique_blocks()
        );
        Ok(map)
    }

    /// Replace this map's state with the one stored at `path`.
    ///
    /// On any error the current state is kept as it was.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        *self = Self::from_file(path)?;
        Ok(())
    }
}
