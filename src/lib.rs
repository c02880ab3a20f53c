//! # blockmap
//!
//! Block-level incremental backup for fixed-size files and block devices.
//!
//! ## Features
//!
//! - **Version Map**: content-addressed dedup ledger with a block layout per backup pass
//! - **Hashing**: fixed-size segmentation with BLAKE3, optionally on the rayon pool
//! - **Persistence**: deterministic binary map format, saved atomically and validated on load
//! - **Driver**: copies only never-seen blocks into per-version payload files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockmap::hash;
//! use blockmap::VersionMap;
//! use chrono::Utc;
//!
//! # fn main() -> blockmap::Result<()> {
//! let image = vec![0u8; 8 * 4096];
//! let hashes = hash::segment(&image, image.len(), 4096)?;
//!
//! let mut map = VersionMap::new();
//! let to_save = map.compute_version_plan(&hashes, Utc::now(), image.len() as u64, 4096)?;
//! println!("Blocks to copy: {:?}", to_save);
//!
//! map.save("blockmap.idx")?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod version_map;

// Re-export commonly used types
pub use backup::{BackupDriver, BackupOutcome, VerifyReport};
pub use config::RepoConfig;
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use version_map::{BlockLocation, Geometry, VersionMap};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
