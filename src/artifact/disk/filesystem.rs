//! Journaled filesystem creation on the partition device.

use tracing::info;

use crate::error::StageResult;
use crate::process::{Cmd, CommandRunner};

/// Create an ext3 (ext2 + journal) filesystem on `device`.
///
/// The filesystem UUID is assigned by mke2fs; read it back with
/// [`crate::boot::uuid_of`].
pub fn format(runner: &dyn CommandRunner, device: &str) -> StageResult<()> {
    Cmd::new("mke2fs")
        .args(["-q", "-F", "-j"])
        .arg(device)
        .error_msg("mke2fs failed")
        .run(runner)?;
    info!(device, "filesystem created");
    Ok(())
}
