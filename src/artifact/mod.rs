//! Artifacts produced by a build.
//!
//! - [`disk`] - The target image: sizing, boot sector, partition table, filesystem
//! - [`payload`] - Live payload copy from the source images into the target

pub mod disk;
pub mod payload;
