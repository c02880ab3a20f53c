//! The version map: a content-addressed dedup ledger plus the block layout of
//! every backup pass recorded against one target.

use crate::hash::{BuildFingerprintHasher, ContentHash};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Where a unique block's bytes live: the pass that first stored it and its
/// index within that pass's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    pub version: u32,
    pub slot: u32,
}

impl BlockLocation {
    pub fn new(version: u32, slot: u32) -> Self {
        Self { version, slot }
    }
}

/// Target geometry, fixed by the first pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub file_size: u64,
    pub block_count: u64,
}

/// One recorded backup pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version: u32,
    pub created: DateTime<Utc>,
    /// One location per logical block position
    pub layout: Vec<BlockLocation>,
    /// Hashes of the blocks this pass stored, in slot order
    pub stored: Vec<ContentHash>,
}

/// Per-version summary for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: u32,
    pub created: DateTime<Utc>,
    pub stored_blocks: usize,
    pub referenced_blocks: usize,
}

/// Statistics about the whole ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapStats {
    pub versions: usize,
    pub block_size: u32,
    pub block_count: u64,
    /// Blocks described across all layouts
    pub logical_blocks: u64,
    /// Blocks physically stored across all payloads
    pub unique_blocks: u64,
    /// Logical blocks per stored block; 1.0 means no deduplication
    pub dedup_ratio: f64,
}

/// In-memory version map for a single backup target.
///
/// Owns its dedup index outright; independent targets get independent maps.
/// Mutating operations either complete or leave the map untouched.
#[derive(Debug, Clone, Default)]
pub struct VersionMap {
    geometry: Option<Geometry>,
    index: HashMap<ContentHash, BlockLocation, BuildFingerprintHasher>,
    versions: Vec<VersionRecord>,
}

impl VersionMap {
    /// Create an empty map with no versions
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest version number, or `None` if no pass has been recorded yet
    pub fn current_version(&self) -> Option<u32> {
        self.versions.last().map(|record| record.version)
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Number of distinct blocks ever observed
    pub fn unique_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn versions(&self) -> &[VersionRecord] {
        &self.versions
    }

    pub fn record(&self, version: u32) -> Option<&VersionRecord> {
        self.versions.get(version as usize)
    }

    pub fn layout(&self, version: u32) -> Option<&[BlockLocation]> {
        self.record(version).map(|r| r.layout.as_slice())
    }

    pub fn timestamp(&self, version: u32) -> Option<DateTime<Utc>> {
        self.record(version).map(|r| r.created)
    }

    /// Number of blocks physically saved by a pass, i.e. its payload slot count
    pub fn stored_blocks(&self, version: u32) -> Option<usize> {
        self.record(version).map(|r| r.stored.len())
    }

    /// Where the content of `position` lives as of `version`
    pub fn locate(&self, version: u32, position: usize) -> Option<BlockLocation> {
        self.layout(version)
            .and_then(|layout| layout.get(position))
            .copied()
    }

    /// Where a given content hash was first stored
    pub fn lookup(&self, hash: &ContentHash) -> Option<BlockLocation> {
        self.index.get(hash).copied()
    }

    /// Diff a pass against everything seen so far.
    ///
    /// Returns the ascending block positions whose content has never been
    /// stored; the k-th position returned is stored in slot k of the new
    /// version's payload. Positions that repeat earlier content (from any
    /// previous version, or earlier in this same pass) become back-references
    /// in the new layout.
    pub fn compute_version_plan(
        &mut self,
        hashes: &[ContentHash],
        time: DateTime<Utc>,
        file_size: u64,
        block_size: u32,
    ) -> Result<Vec<usize>> {
        let geometry = self.check_geometry(hashes.len(), file_size, block_size)?;
        let next_version = match self.current_version() {
            None => 0,
            Some(v) => v
                .checked_add(1)
                .filter(|&n| n != u32::MAX)
                .ok_or_else(|| Error::consistency("version counter exhausted"))?,
        };

        // Nothing below can fail, so the map is never left half-updated
        let mut layout = Vec::with_capacity(hashes.len());
        let mut stored = Vec::new();
        let mut to_save = Vec::new();

        for (position, hash) in hashes.iter().enumerate() {
            match self.index.get(hash) {
                Some(&location) => layout.push(location),
                None => {
                    let location = BlockLocation::new(next_version, stored.len() as u32);
                    self.index.insert(*hash, location);
                    layout.push(location);
                    stored.push(*hash);
                    to_save.push(position);
                }
            }
        }

        debug!(
            version = next_version,
            blocks = hashes.len(),
            new_blocks = to_save.len(),
            "computed version plan"
        );

        self.geometry = Some(geometry);
        self.versions.push(VersionRecord {
            version: next_version,
            created: time,
            layout,
            stored,
        });

        Ok(to_save)
    }

    fn check_geometry(&self, blocks: usize, file_size: u64, block_size: u32) -> Result<Geometry> {
        if u32::try_from(blocks).is_err() {
            return Err(Error::consistency(format!(
                "{} blocks exceed the addressable slot range",
                blocks
            )));
        }

        let proposed = Geometry {
            block_size,
            file_size,
            block_count: blocks as u64,
        };

        match self.geometry {
            None => Ok(proposed),
            Some(fixed) if fixed == proposed => Ok(fixed),
            Some(fixed) => Err(Error::consistency(format!(
                "geometry mismatch: map is bound to block size {}, file size {}, {} blocks; \
                 pass has block size {}, file size {}, {} blocks",
                fixed.block_size,
                fixed.file_size,
                fixed.block_count,
                block_size,
                file_size,
                blocks
            ))),
        }
    }

    /// Rebuild a map from persisted records by replaying every layout in
    /// version order.
    ///
    /// Fails with [`Error::Format`] when records are out of order or a layout
    /// does not match the geometry's block count, and with
    /// [`Error::Consistency`] when an entry points forward in version order,
    /// at a slot its version never stored, or when a version's slots are not
    /// dense.
    pub(crate) fn from_records(
        geometry: Option<Geometry>,
        versions: Vec<VersionRecord>,
    ) -> Result<Self> {
        let block_count = match (geometry, versions.is_empty()) {
            (Some(g), _) => g.block_count,
            (None, true) => 0,
            (None, false) => return Err(Error::format("versions recorded without a geometry")),
        };

        let mut index: HashMap<ContentHash, BlockLocation, BuildFingerprintHasher> =
            HashMap::default();

        for (expected, record) in versions.iter().enumerate() {
            if record.version as usize != expected {
                return Err(Error::format(format!(
                    "record {} is tagged as version {}",
                    expected, record.version
                )));
            }
            if record.layout.len() as u64 != block_count {
                return Err(Error::format(format!(
                    "version {} has {} layout entries, expected {}",
                    record.version,
                    record.layout.len(),
                    block_count
                )));
            }

            let mut next_slot = 0usize;

            for (position, location) in record.layout.iter().enumerate() {
                if location.version > record.version {
                    return Err(Error::consistency(format!(
                        "version {} position {} references later version {}",
                        record.version, position, location.version
                    )));
                }

                let target_stored = versions[location.version as usize].stored.len();
                if location.slot as usize >= target_stored {
                    return Err(Error::consistency(format!(
                        "version {} position {} references slot {} of version {}, which stored {} blocks",
                        record.version, position, location.slot, location.version, target_stored
                    )));
                }

                if location.version != record.version {
                    continue;
                }

                let slot = location.slot as usize;
                if slot == next_slot {
                    let hash = record.stored[slot];
                    if let Some(existing) = index.get(&hash) {
                        return Err(Error::consistency(format!(
                            "version {} slot {} stores {}, already held at version {} slot {}",
                            record.version, slot, hash, existing.version, existing.slot
                        )));
                    }
                    index.insert(hash, *location);
                    next_slot += 1;
                } else if slot > next_slot {
                    return Err(Error::consistency(format!(
                        "version {} position {} uses slot {} before slot {}",
                        record.version, position, slot, next_slot
                    )));
                }
            }

            if next_slot != record.stored.len() {
                return Err(Error::consistency(format!(
                    "version {} stored {} blocks but its layout references {}",
                    record.version,
                    record.stored.len(),
                    next_slot
                )));
            }
        }

        Ok(Self {
            geometry,
            index,
            versions,
        })
    }

    pub fn summaries(&self) -> Vec<VersionSummary> {
        self.versions
            .iter()
            .map(|record| VersionSummary {
                version: record.version,
                created: record.created,
                stored_blocks: record.stored.len(),
                referenced_blocks: record.layout.len() - record.stored.len(),
            })
            .collect()
    }

    pub fn stats(&self) -> MapStats {
        let geometry = self.geometry.unwrap_or_default();
        let logical_blocks = geometry.block_count * self.versions.len() as u64;
        let unique_blocks = self.index.len() as u64;
        let dedup_ratio = if unique_blocks == 0 {
            1.0
        } else {
            logical_blocks as f64 / unique_blocks as f64
        };

        MapStats {
            versions: self.versions.len(),
            block_size: geometry.block_size,
            block_count: geometry.block_count,
            logical_blocks,
            unique_blocks,
            dedup_ratio,
        }
    }
}
