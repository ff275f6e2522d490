//! Loop device operations (losetup).
//!
//! [`LoopDeviceManager`] remembers every binding it creates so the pipeline
//! can detach them all on any exit path.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{StageError, StageResult};
use crate::process::{Cmd, CommandRunner};

/// A file (optionally from a byte offset) exposed as a loop block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    pub device: String,
    pub file: PathBuf,
    pub offset: Option<u64>,
}

pub struct LoopDeviceManager<'r> {
    runner: &'r dyn CommandRunner,
    bindings: Vec<LoopBinding>,
}

impl<'r> LoopDeviceManager<'r> {
    pub fn new(runner: &'r dyn CommandRunner) -> Self {
        Self {
            runner,
            bindings: Vec::new(),
        }
    }

    /// Bindings created by this manager and not yet released, oldest first.
    pub fn active(&self) -> &[LoopBinding] {
        &self.bindings
    }

    /// Ask the kernel for the next unused loop device name.
    pub fn acquire_free_device(&self) -> StageResult<String> {
        let result = Cmd::new("losetup")
            .arg("--find")
            .allow_fail()
            .run(self.runner)?;
        let device = result.stdout.trim();
        if !result.success() || device.is_empty() {
            return Err(StageError::NoFreeDevice);
        }
        Ok(device.to_string())
    }

    /// Attach `file` to `device`, starting `offset` bytes into the file.
    pub fn bind(&mut self, device: &str, file: &Path, offset: Option<u64>) -> StageResult<LoopBinding> {
        let bind_error = |reason: &str| StageError::Bind {
            device: device.to_string(),
            file: file.to_path_buf(),
            reason: reason.to_string(),
        };

        if !file.exists() {
            return Err(bind_error("backing file does not exist"));
        }
        if self.is_bound(device)? {
            return Err(bind_error("device is already bound"));
        }

        let mut cmd = Cmd::new("losetup");
        if let Some(offset) = offset {
            cmd = cmd.args(["-o", &offset.to_string()]);
        }
        cmd.arg(device)
            .arg_path(file)
            .error_msg(&format!("losetup failed to bind {}", device))
            .run(self.runner)?;

        if !self.bound_devices(file, offset)?.iter().any(|d| d == device) {
            return Err(bind_error("binding not visible after losetup"));
        }

        let binding = LoopBinding {
            device: device.to_string(),
            file: file.to_path_buf(),
            offset,
        };
        info!(
            device,
            file = %file.display(),
            offset = offset.unwrap_or(0),
            "loop device bound"
        );
        self.bindings.push(binding.clone());
        Ok(binding)
    }

    /// Find a free device and bind `file` to it.
    pub fn attach(&mut self, file: &Path, offset: Option<u64>) -> StageResult<LoopBinding> {
        let device = self.acquire_free_device()?;
        self.bind(&device, file, offset)
    }

    /// Which loop device currently backs `file` (at `offset`, if given).
    pub fn resolve_device(&self, file: &Path, offset: Option<u64>) -> StageResult<String> {
        self.bound_devices(file, offset)?
            .into_iter()
            .next()
            .ok_or_else(|| StageError::NotBound(file.to_path_buf()))
    }

    /// Whether `device` currently has a backing file.
    pub fn is_bound(&self, device: &str) -> StageResult<bool> {
        let result = Cmd::new("losetup")
            .arg(device)
            .allow_fail()
            .run(self.runner)?;
        Ok(result.success())
    }

    /// Detach `device`. Releasing a device that is already detached is
    /// logged and otherwise a no-op.
    pub fn release(&mut self, device: &str) -> StageResult<()> {
        if !self.is_bound(device)? {
            warn!(device, "loop device already released");
            self.bindings.retain(|b| b.device != device);
            return Ok(());
        }

        Cmd::new("losetup")
            .args(["-d", device])
            .error_msg(&format!("losetup failed to detach {}", device))
            .run(self.runner)?;
        self.bindings.retain(|b| b.device != device);
        info!(device, "loop device released");
        Ok(())
    }

    /// Detach every tracked binding, newest first.
    ///
    /// All bindings are attempted; the first failure is returned and the
    /// failed bindings stay tracked.
    pub fn release_all(&mut self) -> StageResult<()> {
        let devices: Vec<String> = self.bindings.iter().rev().map(|b| b.device.clone()).collect();
        let mut first_error = None;
        for device in devices {
            if let Err(err) = self.release(&device) {
                warn!(device = %device, error = %err, "failed to release loop device");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn bound_devices(&self, file: &Path, offset: Option<u64>) -> StageResult<Vec<String>> {
        let mut cmd = Cmd::new("losetup").arg("-j").arg_path(file);
        if let Some(offset) = offset {
            cmd = cmd.args(["-o", &offset.to_string()]);
        }
        let result = cmd.error_msg("losetup -j failed").run(self.runner)?;
        Ok(parse_associations(&result.stdout))
    }
}

/// Parse `losetup -j` output (`/dev/loop0: [0045]:123 (/path)`) into device names.
fn parse_associations(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once(':').map(|(dev, _)| dev.trim()))
        .filter(|dev| !dev.is_empty())
        .map(str::to_string)
        .collect()
}
