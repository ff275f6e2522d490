//! Everything a run has acquired on the host, released on every exit path.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempDir};
use tracing::{error, info, warn};

use crate::error::{StageError, StageResult};
use crate::loopdev::LoopDeviceManager;
use crate::mount::MountOrchestrator;
use crate::process::CommandRunner;

pub struct ResourceLedger<'r> {
    pub loops: LoopDeviceManager<'r>,
    pub mounts: MountOrchestrator<'r>,
    scratch_root: Option<PathBuf>,
    work_dir: Option<TempDir>,
    image: Option<NamedTempFile>,
}

impl<'r> ResourceLedger<'r> {
    /// `scratch_root` is where the per-run work directory (mount points and
    /// staging) is created; `None` uses the system temp directory.
    pub fn new(runner: &'r dyn CommandRunner, scratch_root: Option<PathBuf>) -> Self {
        Self {
            loops: LoopDeviceManager::new(runner),
            mounts: MountOrchestrator::new(runner),
            scratch_root,
            work_dir: None,
            image: None,
        }
    }

    /// Create `name` inside the run's work directory.
    pub fn scratch_dir(&mut self, name: &str) -> StageResult<PathBuf> {
        let path = self.work_dir()?.join(name);
        fs::create_dir(&path)
            .map_err(|e| StageError::io(format!("creating '{}'", path.display()), e))?;
        Ok(path)
    }

    fn work_dir(&mut self) -> StageResult<PathBuf> {
        if let Some(dir) = &self.work_dir {
            return Ok(dir.path().to_path_buf());
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("biarch-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| StageError::io("creating work directory", e))?;
        let path = dir.path().to_path_buf();
        info!(work_dir = %path.display(), "created work directory");
        self.work_dir = Some(dir);
        Ok(path)
    }

    pub fn set_image(&mut self, image: NamedTempFile) {
        self.image = Some(image);
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image.as_ref().map(NamedTempFile::path)
    }

    pub fn take_image(&mut self) -> Option<NamedTempFile> {
        self.image.take()
    }

    /// Remove the work directory. Refuses while anything is still mounted,
    /// since removal would recurse into the mounted filesystem.
    pub fn remove_scratch(&mut self) -> StageResult<()> {
        let Some(dir) = self.work_dir.take() else {
            return Ok(());
        };
        if !self.mounts.active().is_empty() {
            let path = dir.keep();
            error!(
                work_dir = %path.display(),
                mounts = self.mounts.active().len(),
                "work directory left in place: mounts still active"
            );
            return Err(StageError::io(
                format!("removing work directory '{}'", path.display()),
                std::io::Error::new(std::io::ErrorKind::Other, "mounts still active"),
            ));
        }
        let path = dir.path().to_path_buf();
        dir.close()
            .map_err(|e| StageError::io(format!("removing '{}'", path.display()), e))?;
        info!(work_dir = %path.display(), "removed work directory");
        Ok(())
    }

    /// Whether anything is still held.
    pub fn is_empty(&self) -> bool {
        self.loops.active().is_empty()
            && self.mounts.active().is_empty()
            && self.work_dir.is_none()
            && self.image.is_none()
    }

    /// Unmount, detach, remove scratch space and delete the unfinished
    /// image. Every step is attempted; the first failure is returned.
    pub fn release_all(&mut self) -> StageResult<()> {
        let mut first_error = None;

        if let Err(err) = self.mounts.unmount_all() {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.loops.release_all() {
            first_error.get_or_insert(err);
        }
        if let Err(err) = self.remove_scratch() {
            first_error.get_or_insert(err);
        }
        if let Some(image) = self.image.take() {
            let path = image.path().to_path_buf();
            match image.close() {
                Ok(()) => info!(path = %path.display(), "removed unfinished image"),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove unfinished image");
                    first_error.get_or_insert(StageError::io(
                        format!("removing '{}'", path.display()),
                        err,
                    ));
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ResourceLedger<'_> {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        if let Err(err) = self.release_all() {
            error!(error = %err, "cleanup incomplete");
        }
    }
}
