//! Build configuration.
//!
//! All values have defaults matching a stock Fedora-style Live image, so the
//! CLI runs with [`BuildConfig::default`]. Library callers may load overrides
//! from TOML.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Block size used for image sizing arithmetic.
pub const DEFAULT_BLOCK_SIZE: u64 = 2048;

/// Headroom for boot sector, partition table, journal and bootloader files
/// (102400 blocks of 2048 bytes = 200 MiB).
pub const DEFAULT_MARGIN_BLOCKS: u64 = 102_400;

/// The single partition starts at sector 1.
pub const DEFAULT_PARTITION_OFFSET: u64 = 512;

/// Well-known locations of the syslinux MBR boot code, in lookup order.
pub const MBR_BLOB_CANDIDATES: &[&str] = &[
    "/usr/share/syslinux/mbr.bin",
    "/usr/lib/syslinux/mbr/mbr.bin",
    "/usr/lib/syslinux/bios/mbr.bin",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub block_size: u64,
    pub margin_blocks: u64,
    pub partition_offset: u64,
    pub mbr_blob: PathBuf,
    pub verify_payloads: bool,
    /// Where the per-run work directory is created; system temp dir if unset.
    pub scratch_root: Option<PathBuf>,
    /// Architecture label per source image, assigned positionally.
    pub arch_labels: Vec<String>,
    pub menu: MenuTheme,
    pub layout: PayloadLayout,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            margin_blocks: DEFAULT_MARGIN_BLOCKS,
            partition_offset: DEFAULT_PARTITION_OFFSET,
            mbr_blob: default_mbr_blob(),
            verify_payloads: true,
            scratch_root: None,
            arch_labels: vec!["x86".to_string(), "x64".to_string()],
            menu: MenuTheme::default(),
            layout: PayloadLayout::default(),
        }
    }
}

/// Static presentation settings for the boot menu.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MenuTheme {
    pub title: String,
    /// Tenths of a second.
    pub timeout: u32,
    pub background: String,
    /// Menu labels are `<label_prefix>-<arch>`.
    pub label_prefix: String,
}

impl Default for MenuTheme {
    fn default() -> Self {
        Self {
            title: "Welcome to the Live multi-arch image".to_string(),
            timeout: 100,
            background: "splash.jpg".to_string(),
            label_prefix: "Live".to_string(),
        }
    }
}

/// Names of directories and files inside a Live image and in the target.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PayloadLayout {
    pub live_dir: String,
    pub source_boot_dir: String,
    pub target_boot_dir: String,
    pub root_image: String,
    /// Optional minimal-overlay image; skipped when a source lacks it.
    pub overlay_image: String,
    pub kernel: String,
    pub initrd: String,
}

impl Default for PayloadLayout {
    fn default() -> Self {
        Self {
            live_dir: "LiveOS".to_string(),
            source_boot_dir: "isolinux".to_string(),
            target_boot_dir: "extlinux".to_string(),
            root_image: "squashfs.img".to_string(),
            overlay_image: "osmin.img".to_string(),
            kernel: "vmlinuz0".to_string(),
            initrd: "initrd0.img".to_string(),
        }
    }
}

impl PayloadLayout {
    /// Why `label` cannot name a payload directory at the target root, if
    /// it cannot.
    pub fn label_problem(&self, label: &str) -> Option<&'static str> {
        if label.is_empty() {
            Some("empty")
        } else if label == "." || label == ".." || label.contains('/') {
            Some("not a plain directory name")
        } else if label == self.target_boot_dir {
            Some("collides with the boot directory")
        } else {
            None
        }
    }
}

impl BuildConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parsing build config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the build cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            bail!("block_size must be non-zero");
        }
        if self.partition_offset == 0 || self.partition_offset % 512 != 0 {
            bail!(
                "partition_offset must be a non-zero multiple of 512, got {}",
                self.partition_offset
            );
        }
        let mut seen = std::collections::HashSet::new();
        for label in &self.arch_labels {
            if let Some(problem) = self.layout.label_problem(label) {
                bail!("invalid architecture label '{}': {}", label, problem);
            }
            if !seen.insert(label) {
                bail!("duplicate architecture label '{}'", label);
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("loading build config '{}'", path.display()))
    }
}

fn default_mbr_blob() -> PathBuf {
    MBR_BLOB_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from(MBR_BLOB_CANDIDATES[0]))
}
