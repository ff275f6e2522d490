//! Merge two or more single-architecture Live images into one bootable
//! disk image.
//!
//! The result is a raw disk image holding a boot sector, a single bootable
//! partition starting at sector 1, and an ext3 filesystem with one payload
//! directory per architecture plus an extlinux menu offering each of them.
//!
//! # Architecture
//!
//! ```text
//! BuildPipeline (pipeline)
//!     │
//!     ├── sizing, allocation, partitions, mke2fs   (artifact::disk)
//!     ├── loop devices                            (loopdev)
//!     ├── mounts                                  (mount)
//!     ├── payload copy                            (artifact::payload)
//!     ├── extlinux install and menu               (boot)
//!     └── ResourceLedger: teardown on every exit path
//!
//! every host tool goes through process::CommandRunner
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use biarch_builder::{BuildConfig, BuildPipeline, BuildRequest, SystemRunner};
//! use std::path::PathBuf;
//!
//! let config = BuildConfig::default();
//! let request = BuildRequest::new(
//!     vec![PathBuf::from("live-i686.iso"), PathBuf::from("live-x86_64.iso")],
//!     Some(PathBuf::from("multi.img")),
//!     &config.arch_labels,
//! )?;
//! let report = BuildPipeline::new(&SystemRunner, config, request).run()?;
//! println!("{} ({} bytes)", report.output.display(), report.image_bytes);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod artifact;
pub mod boot;
pub mod config;
pub mod error;
pub mod loopdev;
pub mod mount;
pub mod pipeline;
pub mod preflight;
pub mod process;

#[cfg(test)]
mod test_support;

pub use config::BuildConfig;
pub use error::{BuildError, ErrorKind, StageError, UsageError};
pub use pipeline::{BuildPipeline, BuildReport, BuildRequest, Stage};
pub use process::{CommandRunner, SystemRunner};
