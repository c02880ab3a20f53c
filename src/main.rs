//! blockmap - block-level incremental backup
//!
//! Main binary entry point for the command-line interface.

use anyhow::Context;
use blockmap::cli::{Cli, Commands, LogFormat};
use clap::Parser;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    let repo = get_repo_root(&cli)?;

    let result = match cli.command {
        Commands::Backup(args) => blockmap::cli::backup::run(args, &repo),
        Commands::Versions(args) => blockmap::cli::versions::run(args, &repo),
        Commands::Verify(args) => blockmap::cli::verify::run(args, &repo),
    };

    result.with_context(|| format!("repository {}", repo.display()))
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet { Level::WARN } else { Level::INFO };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    match cli.log_format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }
}

fn get_repo_root(cli: &Cli) -> anyhow::Result<PathBuf> {
    cli.repo
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".blockmap")))
        .context("No repository specified. Use --repo, the BLOCKMAP_REPO env var, or the default ~/.blockmap")
}
