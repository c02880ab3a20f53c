//! Backup driver: hashes a target, plans a new version against the map,
//! copies the new blocks into that version's payload and persists the map.

use crate::codec;
use crate::config::RepoConfig;
use crate::hash::{self, ContentHash};
use crate::version_map::VersionMap;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, warn, Level};

/// Result of a single backup pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub version: u32,
    pub total_blocks: usize,
    pub new_blocks: usize,
    pub bytes_written: u64,
    pub payload: PathBuf,
}

/// A payload that does not match what the map says it should hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadProblem {
    Missing { version: u32 },
    WrongSize { version: u32, expected: u64, actual: u64 },
    HashMismatch { version: u32, slot: usize },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    pub versions_checked: usize,
    pub blocks_checked: u64,
    pub problems: Vec<PayloadProblem>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Drives backup passes for one repository (one target per repository)
#[derive(Debug)]
pub struct BackupDriver {
    root_path: PathBuf,
    config: RepoConfig,
}

impl BackupDriver {
    /// Open a repository, reading its config if it has one
    pub fn open<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let config = RepoConfig::load(root_path.as_ref())?;
        Self::with_config(root_path, config)
    }

    pub fn with_config<P: AsRef<Path>>(root_path: P, config: RepoConfig) -> Result<Self> {
        config.validate()?;
        let root_path = root_path.as_ref().to_path_buf();

        Ok(Self { root_path, config })
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn map_path(&self) -> PathBuf {
        self.config.map_path(&self.root_path)
    }

    /// Load the repository's map, or an empty one before the first backup
    pub fn load_map(&self) -> Result<VersionMap> {
        let path = self.map_path();
        if path.exists() {
            VersionMap::from_file(path)
        } else {
            Ok(VersionMap::new())
        }
    }

    /// Back up `source` as a new version.
    ///
    /// The payload is made durable before the map is saved, so an interrupted
    /// pass never leaves the map pointing at blocks that were not written.
    pub fn run<P: AsRef<Path>>(&self, source: P) -> Result<BackupOutcome> {
        let source = source.as_ref();
        let span = span!(Level::INFO, "backup", source = %source.display());
        let _enter = span.enter();

        let mut file = File::open(source)?;
        // Block devices report zero length in their metadata
        let file_size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        let modified: DateTime<Utc> = DateTime::from(file.metadata()?.modified()?);
        let len = usize::try_from(file_size).map_err(|_| {
            Error::invalid_input(format!("{} bytes cannot be mapped on this platform", file_size))
        })?;

        let mapping = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and dropped before returning; the
            // source must not be modified while a pass is running.
            Some(unsafe { MmapOptions::new().len(len).map(&file)? })
        };
        let data: &[u8] = mapping.as_deref().unwrap_or(&[]);

        let hashes = self.hash_blocks(data, len)?;
        debug!("Hashed {} blocks of {} bytes", hashes.len(), self.config.block_size);

        let mut map = self.load_map()?;
        let plan = map.compute_version_plan(&hashes, modified, file_size, self.config.block_size)?;
        let version = map
            .current_version()
            .ok_or_else(|| Error::consistency("map recorded no version"))?;

        fs::create_dir_all(&self.root_path)?;
        fs::create_dir_all(self.config.payload_path(&self.root_path))?;
        let payload = self.config.version_payload_path(&self.root_path, version);
        let bytes_written = write_payload(&payload, data, &plan, self.config.block_size as usize)?;

        map.save(self.map_path())?;
        if !RepoConfig::config_path(&self.root_path).exists() {
            self.config.save(&self.root_path)?;
        }

        info!(
            "Backup completed: version {}, {} of {} blocks new, {} bytes written",
            version,
            plan.len(),
            hashes.len(),
            bytes_written
        );

        Ok(BackupOutcome {
            version,
            total_blocks: hashes.len(),
            new_blocks: plan.len(),
            bytes_written,
            payload,
        })
    }

    fn hash_blocks(&self, data: &[u8], len: usize) -> Result<Vec<ContentHash>> {
        let block_size = self.config.block_size as usize;
        if self.config.parallel_hashing {
            hash::segment_parallel(data, len, block_size)
        } else {
            hash::segment(data, len, block_size)
        }
    }

    /// Check every version's payload against the map.
    ///
    /// Sizes are always checked; with `deep` every stored block is re-hashed
    /// and compared with the hash recorded for its slot.
    pub fn verify(&self, deep: bool) -> Result<VerifyReport> {
        let map = self.load_map()?;
        let block_size = map.geometry().map(|g| g.block_size).unwrap_or(0) as usize;
        let mut report = VerifyReport::default();

        for record in map.versions() {
            report.versions_checked += 1;
            let path = self.config.version_payload_path(&self.root_path, record.version);

            let actual = match fs::metadata(&path) {
                Ok(metadata) => metadata.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Payload for version {} is missing", record.version);
                    report.problems.push(PayloadProblem::Missing {
                        version: record.version,
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let expected = (record.stored.len() * block_size) as u64;
            if actual != expected {
                warn!(
                    "Payload for version {} is {} bytes, expected {}",
                    record.version, actual, expected
                );
                report.problems.push(PayloadProblem::WrongSize {
                    version: record.version,
                    expected,
                    actual,
                });
                continue;
            }

            if !deep {
                continue;
            }

            let mut reader = BufReader::new(File::open(&path)?);
            let mut block = vec![0u8; block_size];
            for (slot, stored) in record.stored.iter().enumerate() {
                reader.read_exact(&mut block)?;
                report.blocks_checked += 1;
                if hash::hash(&block) != *stored {
                    warn!("Version {} slot {} does not match its hash", record.version, slot);
                    report.problems.push(PayloadProblem::HashMismatch {
                        version: record.version,
                        slot,
                    });
                }
            }
        }

        Ok(report)
    }
}

/// Copy the planned blocks, in plan order, into a staged payload file and
/// rename it into place. Plan entry k lands in slot k.
fn write_payload(path: &Path, data: &[u8], plan: &[usize], block_size: usize) -> Result<u64> {
    let staging = codec::staging_path(path);

    let written = File::create(&staging).and_then(|file| {
        let mut writer = BufWriter::new(file);
        for &position in plan {
            let start = position * block_size;
            writer.write_all(&data[start..start + block_size])?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((plan.len() * block_size) as u64)
    });

    match written.and_then(|n| fs::rename(&staging, path).map(|_| n)) {
        Ok(n) => Ok(n),
        Err(e) => {
            let _ = fs::remove_file(&staging);
            Err(Error::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn driver(root: &Path, parallel_hashing: bool) -> Result<BackupDriver> {
        BackupDriver::with_config(
            root,
            RepoConfig {
                block_size: 4,
                parallel_hashing,
                ..RepoConfig::default()
            },
        )
    }

    #[test]
    fn test_incremental_passes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("disk.img");
        let engine = driver(&temp_dir.path().join("repo"), false)?;

        fs::write(&source, b"AAAABBBBCCCCAAAA")?;
        let first = engine.run(&source)?;
        assert_eq!(first.version, 0);
        assert_eq!(first.total_blocks, 4);
        assert_eq!(first.new_blocks, 3);
        assert_eq!(fs::read(&first.payload)?, b"AAAABBBBCCCC");

        let second = engine.run(&source)?;
        assert_eq!(second.version, 1);
        assert_eq!(second.new_blocks, 0);
        assert_eq!(fs::read(&second.payload)?, b"");

        fs::write(&source, b"AAAABBBBDDDDAAAA")?;
        let third = engine.run(&source)?;
        assert_eq!(third.version, 2);
        assert_eq!(third.new_blocks, 1);
        assert_eq!(fs::read(&third.payload)?, b"DDDD");

        let map = engine.load_map()?;
        assert_eq!(map.version_count(), 3);
        assert!(engine.verify(true)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_parallel_hashing_gives_same_plan() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("disk.img");
        fs::write(&source, b"ABCDABCDEFGHIJKLEFGH")?;

        let sequential = driver(&temp_dir.path().join("seq"), false)?.run(&source)?;
        let parallel = driver(&temp_dir.path().join("par"), true)?.run(&source)?;
        assert_eq!(sequential.new_blocks, parallel.new_blocks);
        assert_eq!(fs::read(&sequential.payload)?, fs::read(&parallel.payload)?);
        Ok(())
    }

    #[test]
    fn test_resized_source_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("disk.img");
        let engine = driver(&temp_dir.path().join("repo"), false)?;

        fs::write(&source, b"AAAABBBB")?;
        engine.run(&source)?;
        let saved = fs::read(engine.map_path())?;

        fs::write(&source, b"AAAABBBBCCCC")?;
        assert!(matches!(engine.run(&source), Err(Error::Consistency { .. })));
        assert_eq!(fs::read(engine.map_path())?, saved);
        Ok(())
    }

    #[test]
    fn test_partial_block_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("disk.img");
        fs::write(&source, b"AAAABB")?;

        let engine = driver(&temp_dir.path().join("repo"), false)?;
        assert!(matches!(engine.run(&source), Err(Error::InvalidInput { .. })));
        assert!(!engine.map_path().exists());
        Ok(())
    }

    #[test]
    fn test_empty_source() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("empty.img");
        fs::write(&source, b"")?;

        let outcome = driver(&temp_dir.path().join("repo"), true)?.run(&source)?;
        assert_eq!(outcome.version, 0);
        assert_eq!(outcome.total_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_verify_reports_damage() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("disk.img");
        let engine = driver(&temp_dir.path().join("repo"), false)?;

        fs::write(&source, b"AAAABBBB")?;
        let first = engine.run(&source)?;
        fs::write(&source, b"CCCCBBBB")?;
        let second = engine.run(&source)?;

        fs::write(&first.payload, b"XXXXBBBB")?;
        assert!(engine.verify(false)?.is_clean());
        assert_eq!(
            engine.verify(true)?.problems,
            vec![PayloadProblem::HashMismatch { version: 0, slot: 0 }]
        );

        fs::remove_file(&second.payload)?;
        let report = engine.verify(false)?;
        assert_eq!(report.versions_checked, 2);
        assert_eq!(report.problems, vec![PayloadProblem::Missing { version: 1 }]);
        Ok(())
    }

    #[test]
    fn test_read_only_operations_leave_no_trace() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let repo = temp_dir.path().join("repo");

        let engine = BackupDriver::open(&repo)?;
        assert_eq!(engine.load_map()?.version_count(), 0);
        assert!(engine.verify(true)?.is_clean());
        assert!(!repo.exists());
        Ok(())
    }

    #[test]
    fn test_first_run_writes_config() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let repo = temp_dir.path().join("repo");
        let source = temp_dir.path().join("disk.img");
        fs::write(&source, b"AAAA")?;

        driver(&repo, false)?.run(&source)?;
        let reopened = BackupDriver::open(&repo)?;
        assert_eq!(reopened.config().block_size, 4);
        assert_eq!(reopened.load_map()?.current_version(), Some(0));
        Ok(())
    }
}
