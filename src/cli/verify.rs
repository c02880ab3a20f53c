//! Verify command implementation.

use super::OutputFormat;
use crate::backup::{BackupDriver, PayloadProblem};
use crate::{Error, Result};
use clap::Args;
use std::path::Path;

/// Arguments for the verify command
#[derive(Args)]
pub struct VerifyArgs {
    /// Re-hash every stored block instead of only checking sizes
    #[arg(long)]
    pub deep: bool,

    /// Output format
    #[arg(long, default_value = "table")]
    pub format: OutputFormat,
}

/// Run the verify command
pub fn run(args: VerifyArgs, repo: &Path) -> Result<()> {
    let driver = BackupDriver::open(repo)?;
    let report = driver.verify(args.deep)?;

    match args.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).unwrap_or_else(|e| e.to_string())
            );
        }
        OutputFormat::Table => {
            println!(
                "Checked {} versions, {} blocks",
                report.versions_checked, report.blocks_checked
            );
            for problem in &report.problems {
                match problem {
                    PayloadProblem::Missing { version } => {
                        println!("  version {}: payload missing", version)
                    }
                    PayloadProblem::WrongSize {
                        version,
                        expected,
                        actual,
                    } => println!(
                        "  version {}: payload is {} bytes, expected {}",
                        version, actual, expected
                    ),
                    PayloadProblem::HashMismatch { version, slot } => {
                        println!("  version {}: slot {} is corrupt", version, slot)
                    }
                }
            }
        }
    }

    if report.is_clean() {
        Ok(())
    } else {
        Err(Error::IntegrityError {
            reason: format!("{} payload problems found", report.problems.len()),
        })
    }
}
