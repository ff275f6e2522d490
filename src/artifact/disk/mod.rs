//! Target disk image construction.
//!
//! - [`sizing`] - block count arithmetic and zero-filled allocation
//! - [`partitions`] - boot sector, DOS partition table and its verification
//! - [`filesystem`] - journaled filesystem on the partition device

pub mod filesystem;
pub mod partitions;
pub mod sizing;

pub use partitions::{MbrPartition, SECTOR_SIZE};
pub use sizing::{allocate_image, compute_block_count};
