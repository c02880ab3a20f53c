//! Backup command implementation.

use crate::backup::BackupDriver;
use crate::config::RepoConfig;
use crate::{Error, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// File or block device to back up
    #[arg(short, long)]
    pub source: PathBuf,

    /// Block size in KiB; only honoured before the first version exists
    #[arg(long)]
    pub block_size_kb: Option<u32>,

    /// Hash blocks on a single thread
    #[arg(long)]
    pub sequential: bool,
}

/// Run the backup command
pub fn run(args: BackupArgs, repo: &Path) -> Result<()> {
    let mut config = RepoConfig::load(repo)?;

    if let Some(kb) = args.block_size_kb {
        let block_size = kb.checked_mul(1024).ok_or_else(|| Error::Configuration {
            reason: format!("block size of {} KiB is too large", kb),
        })?;
        if RepoConfig::config_path(repo).exists() && block_size != config.block_size {
            return Err(Error::Configuration {
                reason: format!(
                    "repository block size is fixed at {} bytes",
                    config.block_size
                ),
            });
        }
        config.block_size = block_size;
    }
    if args.sequential {
        config.parallel_hashing = false;
    }

    println!("Starting backup: {} -> {}", args.source.display(), repo.display());

    let driver = BackupDriver::with_config(repo, config)?;
    let outcome = driver.run(&args.source)?;

    println!("Backup completed successfully!");
    println!("  Version: {}", outcome.version);
    println!("  Blocks: {}", outcome.total_blocks);
    println!("  New blocks: {}", outcome.new_blocks);
    println!("  Bytes written: {}", outcome.bytes_written);
    println!("  Payload: {}", outcome.payload.display());

    Ok(())
}
