//! Payload copy from mounted source images into the target tree.
//!
//! Root filesystem images go through a staging directory on a regular
//! filesystem: copying straight from one loop mount to another is much
//! slower. The bootloader directory of the first source is copied whole;
//! later sources only contribute a renamed kernel and initrd.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::boot::BootEntry;
use crate::config::PayloadLayout;
use crate::error::{StageError, StageResult};

/// A mounted source image and the architecture label it provides.
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub arch: String,
    pub root: PathBuf,
}

pub struct PayloadCopier<'a> {
    layout: &'a PayloadLayout,
    staging: &'a Path,
    verify: bool,
}

impl<'a> PayloadCopier<'a> {
    pub fn new(layout: &'a PayloadLayout, staging: &'a Path, verify: bool) -> Self {
        Self {
            layout,
            staging,
            verify,
        }
    }

    /// Copy every source into `target` and return one boot entry per source,
    /// in source order.
    ///
    /// All sources are checked for the expected layout before anything is
    /// copied.
    pub fn copy_all(&self, sources: &[SourceTree], target: &Path) -> StageResult<Vec<BootEntry>> {
        for source in sources {
            self.check_layout(source)?;
        }

        let boot_dir = target.join(&self.layout.target_boot_dir);
        create_dir(&boot_dir)?;

        let mut entries = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            info!(arch = %source.arch, root = %source.root.display(), "copying payload");
            let live_dir = self.copy_live_images(source, target)?;

            let source_boot = source.root.join(&self.layout.source_boot_dir);
            let (kernel, initrd) = if index == 0 {
                self.copy_boot_dir(&source_boot, &boot_dir)?;
                (self.layout.kernel.clone(), self.layout.initrd.clone())
            } else {
                let kernel = free_indexed_name(&boot_dir, &self.layout.kernel, index);
                let initrd = free_indexed_name(&boot_dir, &self.layout.initrd, index);
                self.copy_file(&source_boot.join(&self.layout.kernel), &boot_dir.join(&kernel))?;
                self.copy_file(&source_boot.join(&self.layout.initrd), &boot_dir.join(&initrd))?;
                (kernel, initrd)
            };

            entries.push(BootEntry {
                arch: source.arch.clone(),
                kernel,
                initrd,
                live_dir,
            });
        }
        Ok(entries)
    }

    /// Files that must exist in every source image.
    fn check_layout(&self, source: &SourceTree) -> StageResult<()> {
        let boot = source.root.join(&self.layout.source_boot_dir);
        let required = [
            source.root.join(&self.layout.live_dir).join(&self.layout.root_image),
            boot.join(&self.layout.kernel),
            boot.join(&self.layout.initrd),
        ];
        match required.into_iter().find(|path| !path.is_file()) {
            Some(missing) => Err(StageError::Payload(missing)),
            None => Ok(()),
        }
    }

    /// Copy root and overlay images into `/<arch>/<live_dir>/`, returning
    /// that directory as an absolute path inside the target filesystem.
    fn copy_live_images(&self, source: &SourceTree, target: &Path) -> StageResult<String> {
        let src_live = source.root.join(&self.layout.live_dir);
        let dst_live = target.join(&source.arch).join(&self.layout.live_dir);
        create_dir(&dst_live)?;

        self.copy_via_staging(&src_live.join(&self.layout.root_image), &dst_live)?;

        let overlay = src_live.join(&self.layout.overlay_image);
        if overlay.is_file() {
            self.copy_via_staging(&overlay, &dst_live)?;
        } else {
            info!(arch = %source.arch, image = %self.layout.overlay_image, "no overlay image in source");
        }

        Ok(format!("/{}/{}", source.arch, self.layout.live_dir))
    }

    fn copy_via_staging(&self, src: &Path, dst_dir: &Path) -> StageResult<()> {
        let name = src
            .file_name()
            .ok_or_else(|| StageError::Payload(src.to_path_buf()))?;
        let staged = self.staging.join(name);
        self.copy_file(src, &staged)?;
        self.copy_file(&staged, &dst_dir.join(name))?;
        fs::remove_file(&staged).map_err(|e| {
            StageError::io(format!("removing staged copy '{}'", staged.display()), e)
        })
    }

    /// Copy the whole bootloader directory, preserving subdirectories and
    /// symlinks.
    fn copy_boot_dir(&self, src: &Path, dst: &Path) -> StageResult<()> {
        for entry in WalkDir::new(src).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(src).to_path_buf();
                StageError::io(format!("walking '{}'", path.display()), e.into())
            })?;
            let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let dst_path = dst.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                create_dir(&dst_path)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(|e| {
                    StageError::io(format!("reading link '{}'", entry.path().display()), e)
                })?;
                std::os::unix::fs::symlink(&target, &dst_path).map_err(|e| {
                    StageError::io(format!("creating symlink '{}'", dst_path.display()), e)
                })?;
            } else {
                self.copy_file(entry.path(), &dst_path)?;
            }
        }
        Ok(())
    }

    /// Copy one file and check the copy against the source: size always,
    /// sha256 when verification is enabled.
    fn copy_file(&self, src: &Path, dst: &Path) -> StageResult<()> {
        if !src.is_file() {
            return Err(StageError::Payload(src.to_path_buf()));
        }
        let copied = fs::copy(src, dst).map_err(|e| {
            StageError::io(
                format!("copying '{}' -> '{}'", src.display(), dst.display()),
                e,
            )
        })?;
        let expected = fs::metadata(src)
            .map_err(|e| StageError::io(format!("reading '{}'", src.display()), e))?
            .len();
        if copied != expected {
            return Err(StageError::PayloadMismatch {
                path: dst.to_path_buf(),
                detail: format!("{} bytes copied, source has {}", copied, expected),
            });
        }

        if self.verify {
            let (src_sha, _) = sha256_file(src)?;
            let (dst_sha, _) = sha256_file(dst)?;
            if src_sha != dst_sha {
                return Err(StageError::PayloadMismatch {
                    path: dst.to_path_buf(),
                    detail: format!("sha256 {} != {}", dst_sha, src_sha),
                });
            }
        }
        debug!(src = %src.display(), dst = %dst.display(), bytes = copied, "copied");
        Ok(())
    }
}

/// `vmlinuz0` -> `vmlinuz<index>`, `initrd0.img` -> `initrd<index>.img`.
pub fn indexed_name(name: &str, index: usize) -> String {
    let (stem, ext) = match name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    let base = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    match ext {
        Some(ext) => format!("{}{}.{}", base, index, ext),
        None => format!("{}{}", base, index),
    }
}

/// First of `indexed_name(name, index)`, `indexed_name(name, index + 1)`, ...
/// not already present in `dir`.
fn free_indexed_name(dir: &Path, name: &str, index: usize) -> String {
    (index..)
        .map(|n| indexed_name(name, n))
        .find(|candidate| !dir.join(candidate).exists())
        .unwrap_or_else(|| indexed_name(name, index))
}

/// Streaming sha256 of a file, with its size.
pub fn sha256_file(path: &Path) -> StageResult<(String, u64)> {
    let f = File::open(path)
        .map_err(|e| StageError::io(format!("opening '{}'", path.display()), e))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .map_err(|e| StageError::io(format!("reading '{}'", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn create_dir(path: &Path) -> StageResult<()> {
    fs::create_dir_all(path)
        .map_err(|e| StageError::io(format!("creating directory '{}'", path.display()), e))
}
