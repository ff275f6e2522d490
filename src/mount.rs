//! Mount and unmount of block devices, with tracking for teardown.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{StageError, StageResult};
use crate::process::{Cmd, CommandRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub device: String,
    pub mount_point: PathBuf,
}

pub struct MountOrchestrator<'r> {
    runner: &'r dyn CommandRunner,
    mounts: Vec<MountRecord>,
}

impl<'r> MountOrchestrator<'r> {
    pub fn new(runner: &'r dyn CommandRunner) -> Self {
        Self {
            runner,
            mounts: Vec::new(),
        }
    }

    /// Mounts made by this orchestrator that are still tracked, oldest first.
    pub fn active(&self) -> &[MountRecord] {
        &self.mounts
    }

    /// Mount `device` at `mount_point`, creating the directory if needed.
    pub fn mount(&mut self, device: &str, mount_point: &Path, options: Option<&str>) -> StageResult<()> {
        if !mount_point.exists() {
            fs::create_dir_all(mount_point).map_err(|e| {
                StageError::io(
                    format!("creating mount point '{}'", mount_point.display()),
                    e,
                )
            })?;
        }

        let mut cmd = Cmd::new("mount");
        if let Some(options) = options {
            cmd = cmd.args(["-o", options]);
        }
        cmd.arg(device)
            .arg_path(mount_point)
            .run(self.runner)
            .map_err(|e| StageError::Mount {
                device: device.to_string(),
                mount_point: mount_point.to_path_buf(),
                reason: e.to_string(),
            })?;

        info!(device, mount_point = %mount_point.display(), "mounted");
        self.mounts.push(MountRecord {
            device: device.to_string(),
            mount_point: mount_point.to_path_buf(),
        });
        Ok(())
    }

    pub fn is_mounted(&self, mount_point: &Path) -> StageResult<bool> {
        let result = Cmd::new("mountpoint")
            .arg("-q")
            .arg_path(mount_point)
            .allow_fail()
            .run(self.runner)?;
        Ok(result.success())
    }

    /// Unmount `mount_point`. Unmounting something that is not mounted is
    /// logged and otherwise a no-op.
    pub fn unmount(&mut self, mount_point: &Path) -> StageResult<()> {
        if !self.is_mounted(mount_point)? {
            warn!(mount_point = %mount_point.display(), "already unmounted");
            self.mounts.retain(|m| m.mount_point != mount_point);
            return Ok(());
        }

        Cmd::new("umount")
            .arg_path(mount_point)
            .error_msg(&format!("umount of '{}' failed", mount_point.display()))
            .run(self.runner)?;
        self.mounts.retain(|m| m.mount_point != mount_point);
        info!(mount_point = %mount_point.display(), "unmounted");
        Ok(())
    }

    /// Unmount every tracked mount, newest first. Every mount is attempted;
    /// the first failure is returned and failed mounts stay tracked.
    pub fn unmount_all(&mut self) -> StageResult<()> {
        let points: Vec<PathBuf> = self
            .mounts
            .iter()
            .rev()
            .map(|m| m.mount_point.clone())
            .collect();
        let mut first_error = None;
        for point in points {
            if let Err(err) = self.unmount(&point) {
                warn!(mount_point = %point.display(), error = %err, "failed to unmount");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
