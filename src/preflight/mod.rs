//! Preflight checks for build validation.
//!
//! Validates that the host has the required tools, privileges and boot
//! code before any loop device or mount is touched. This prevents a run
//! from failing halfway through with a half-built image.
//!
//! # Example
//!
//! ```rust
//! use biarch_builder::preflight::{check_required_tools, command_exists};
//! use biarch_builder::process::SystemRunner;
//!
//! if !command_exists(&SystemRunner, "extlinux") {
//!     println!("syslinux not installed");
//! }
//!
//! let tools = &[("sfdisk", "util-linux"), ("mke2fs", "e2fsprogs")];
//! if let Err(e) = check_required_tools(&SystemRunner, tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use std::path::Path;

use crate::error::{StageError, StageResult};
use crate::process::CommandRunner;

/// Check if a command exists on the host system.
pub fn command_exists(runner: &dyn CommandRunner, cmd: &str) -> bool {
    runner.locate(cmd).is_some()
}

/// Host tools the build invokes.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mountpoint", "util-linux"),
    ("blkid", "util-linux"),
    ("sfdisk", "util-linux"),
    ("dd", "coreutils"),
    ("mke2fs", "e2fsprogs"),
    ("extlinux", "syslinux"),
];

/// Check that specific tools are available.
///
/// Returns [`StageError::MissingTools`] listing every missing tool with the
/// package that provides it.
pub fn check_required_tools(runner: &dyn CommandRunner, tools: &[(&str, &str)]) -> StageResult<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(runner, tool))
        .map(|(tool, package)| format!("  {} (install: {})", tool, package))
        .collect();

    if !missing.is_empty() {
        return Err(StageError::MissingTools(missing.join("\n")));
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`] plus the MBR boot code blob.
pub fn check_host(runner: &dyn CommandRunner, mbr_blob: &Path) -> StageResult<()> {
    check_required_tools(runner, REQUIRED_TOOLS)?;
    if !mbr_blob.is_file() {
        return Err(StageError::BootSector {
            path: mbr_blob.to_path_buf(),
            reason: "boot code blob not found (install syslinux)".to_string(),
        });
    }
    Ok(())
}

/// Loop devices and mounts need root.
pub fn require_root() -> StageResult<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(StageError::NotPrivileged(euid));
    }
    Ok(())
}
