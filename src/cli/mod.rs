//! Command-line interface for blockmap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod backup;
pub mod verify;
pub mod versions;

/// blockmap - block-level incremental backup of files and block devices
#[derive(Parser)]
#[command(name = "blockmap")]
#[command(about = "Block-level incremental backup of files and block devices")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Repository directory holding the map and payloads
    #[arg(long, short = 'r', global = true, env = "BLOCKMAP_REPO")]
    pub repo: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Log format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Back up a file or block device as a new version
    Backup(backup::BackupArgs),
    /// List recorded versions
    Versions(versions::VersionsArgs),
    /// Check payload files against the map
    Verify(verify::VerifyArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OutputFormat {
    Table,
    Json,
}
