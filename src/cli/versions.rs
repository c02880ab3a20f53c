//! Versions command implementation.

use super::OutputFormat;
use crate::backup::BackupDriver;
use crate::Result;
use clap::Args;
use serde_json::json;
use std::path::Path;

/// Arguments for the versions command
#[derive(Args)]
pub struct VersionsArgs {
    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Run the versions command
pub fn run(args: VersionsArgs, repo: &Path) -> Result<()> {
    let driver = BackupDriver::open(repo)?;
    let map = driver.load_map()?;
    let stats = map.stats();

    match args.format {
        OutputFormat::Json => {
            let output = json!({
                "geometry": map.geometry(),
                "stats": stats,
                "versions": map.summaries(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_else(|e| e.to_string())
            );
        }
        OutputFormat::Table => {
            if map.version_count() == 0 {
                println!("No versions recorded in {}", repo.display());
                return Ok(());
            }

            println!("{:<8} {:<26} {:>10} {:>12}", "VERSION", "CREATED", "STORED", "REFERENCED");
            println!("{}", "-".repeat(59));
            for summary in map.summaries() {
                println!(
                    "{:<8} {:<26} {:>10} {:>12}",
                    summary.version,
                    summary.created.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                    summary.stored_blocks,
                    summary.referenced_blocks
                );
            }
            println!();
            println!(
                "{} versions, {} unique blocks of {} bytes, dedup ratio {:.2}",
                stats.versions, stats.unique_blocks, stats.block_size, stats.dedup_ratio
            );
        }
    }

    Ok(())
}
