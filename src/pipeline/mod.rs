//! The multi-arch image build, as a strictly ordered sequence of stages.
//!
//! ```text
//! Preflight → Sizing → Allocating → BootSectorWrite → Partitioning →
//! Formatting → MountingTarget → AttachingSources → MountingSources →
//! StagingPayloads → ConfiguringBoot → Unmounting → Detaching →
//! Finalizing → Done
//! ```
//!
//! Any failure enters `Aborting`: every tracked mount is unmounted, every
//! loop device detached, the work directory and the unfinished image are
//! removed, and the original error is returned. The output path is only
//! touched in `Finalizing`, by an atomic rename over it.

mod ledger;
mod stage;

pub use ledger::ResourceLedger;
pub use stage::Stage;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::artifact::disk::{self, filesystem, partitions, SECTOR_SIZE};
use crate::artifact::payload::{PayloadCopier, SourceTree};
use crate::boot::{self, BootEntry};
use crate::config::BuildConfig;
use crate::error::{BuildError, StageError, StageResult, UsageError};
use crate::loopdev::LoopBinding;
use crate::preflight;
use crate::process::CommandRunner;

/// A source Live image and the architecture it provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchSource {
    pub arch: String,
    pub image: PathBuf,
}

/// Validated inputs of a build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub sources: Vec<ArchSource>,
    pub output: PathBuf,
}

impl BuildRequest {
    /// Validate arguments before anything on the host is touched.
    ///
    /// Sources get architecture labels from `labels` by position.
    pub fn new(images: Vec<PathBuf>, output: Option<PathBuf>, labels: &[String]) -> Result<Self, UsageError> {
        if images.len() < 2 {
            return Err(UsageError::TooFewSources(images.len()));
        }
        if labels.len() < images.len() {
            return Err(UsageError::NotEnoughLabels {
                sources: images.len(),
                labels: labels.len(),
            });
        }
        for image in &images {
            if !image.exists() {
                return Err(UsageError::MissingSource(image.clone()));
            }
            if !image.is_file() {
                return Err(UsageError::SourceNotAFile(image.clone()));
            }
        }

        let output = output
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(UsageError::MissingOutput)?;
        let output_dir = output_parent(&output);
        if !output_dir.is_dir() {
            return Err(UsageError::OutputDirMissing(output_dir));
        }
        if let Ok(existing) = fs::canonicalize(&output) {
            if images
                .iter()
                .any(|image| fs::canonicalize(image).map_or(false, |i| i == existing))
            {
                return Err(UsageError::OutputIsSource(output));
            }
        }

        let sources = images
            .into_iter()
            .zip(labels)
            .map(|(image, arch)| ArchSource {
                arch: arch.clone(),
                image,
            })
            .collect();
        Ok(Self { sources, output })
    }
}

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output: PathBuf,
    pub uuid: String,
    pub entries: Vec<BootEntry>,
    pub block_count: u64,
    pub image_bytes: u64,
}

pub struct BuildPipeline<'r> {
    runner: &'r dyn CommandRunner,
    config: BuildConfig,
    request: BuildRequest,
    interrupt: Option<Arc<AtomicBool>>,
    ledger: ResourceLedger<'r>,
    stage: Stage,
}

impl<'r> BuildPipeline<'r> {
    pub fn new(runner: &'r dyn CommandRunner, config: BuildConfig, request: BuildRequest) -> Self {
        Self {
            runner,
            ledger: ResourceLedger::new(runner, config.scratch_root.clone()),
            config,
            request,
            interrupt: None,
            stage: Stage::Preflight,
        }
    }

    /// Create the per-run work directory under `root`, overriding
    /// [`BuildConfig::scratch_root`].
    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.ledger = ResourceLedger::new(self.runner, Some(root));
        self
    }

    /// Abort at the next stage transition once `flag` is set.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run every stage. On failure all acquired resources are released
    /// before the error is returned.
    pub fn run(mut self) -> Result<BuildReport, BuildError> {
        self.check_inputs()?;
        match self.execute() {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(stage = %self.stage, error = %err, "build failed, aborting");
                self.stage = Stage::Aborting;
                if let Err(cleanup) = self.ledger.release_all() {
                    error!(error = %cleanup, "cleanup incomplete");
                }
                Err(err)
            }
        }
    }

    /// Reject configurations and labels that would place payload outside
    /// its own directory, before any stage runs.
    fn check_inputs(&self) -> Result<(), UsageError> {
        self.config
            .validate()
            .map_err(|e| UsageError::InvalidConfig(format!("{:#}", e)))?;
        let mut seen = HashSet::new();
        for source in &self.request.sources {
            let reason = match self.config.layout.label_problem(&source.arch) {
                Some(problem) => problem,
                None if !seen.insert(source.arch.as_str()) => "used by more than one source",
                None => continue,
            };
            return Err(UsageError::InvalidLabel {
                label: source.arch.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<BuildReport, BuildError> {
        self.step(Stage::Preflight, Self::preflight)?;
        let block_count = self.step(Stage::Sizing, Self::size)?;
        self.step(Stage::Allocating, |p| p.allocate(block_count))?;
        let whole = self.step(Stage::BootSectorWrite, Self::write_boot_sector)?;
        self.step(Stage::Partitioning, |p| p.partition(&whole))?;
        let partition = self.step(Stage::Formatting, Self::format)?;
        let target = self.step(Stage::MountingTarget, |p| p.mount_target(&partition))?;
        let devices = self.step(Stage::AttachingSources, Self::attach_sources)?;
        let trees = self.step(Stage::MountingSources, |p| p.mount_sources(&devices))?;
        let entries = self.step(Stage::StagingPayloads, |p| p.stage_payloads(&trees, &target))?;
        let uuid = self.step(Stage::ConfiguringBoot, |p| {
            p.configure_boot(&partition, &target, &entries)
        })?;
        self.step(Stage::Unmounting, |p| p.ledger.mounts.unmount_all())?;
        self.step(Stage::Detaching, |p| p.ledger.loops.release_all())?;
        let image_bytes = self.step(Stage::Finalizing, Self::finalize)?;
        self.complete();

        info!(
            output = %self.request.output.display(),
            uuid = %uuid,
            bytes = image_bytes,
            "multi-arch image built"
        );
        Ok(BuildReport {
            output: self.request.output.clone(),
            uuid,
            entries,
            block_count,
            image_bytes,
        })
    }

    /// Enter `stage` and run `f`, attributing any failure to that stage.
    fn step<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce(&mut Self) -> StageResult<T>,
    ) -> Result<T, BuildError> {
        if self.interrupted() {
            return Err(BuildError::stage(stage, StageError::Interrupted));
        }
        self.stage = stage;
        info!(stage = %stage, "entering stage");
        f(self).map_err(|e| BuildError::stage(stage, e))
    }

    /// The output is already in place once `Finalizing` returns, so a
    /// late interrupt no longer turns the run into a failure.
    fn complete(&mut self) {
        self.stage = Stage::Done;
        info!(stage = %Stage::Done, "entering stage");
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn preflight(&mut self) -> StageResult<()> {
        preflight::check_host(self.runner, &self.config.mbr_blob)
    }

    fn size(&mut self) -> StageResult<u64> {
        let mut sizes = Vec::with_capacity(self.request.sources.len());
        for source in &self.request.sources {
            let len = fs::metadata(&source.image)
                .map_err(|e| StageError::io(format!("reading '{}'", source.image.display()), e))?
                .len();
            sizes.push(len);
        }
        let count = disk::compute_block_count(&sizes, self.config.block_size, self.config.margin_blocks)?;
        info!(
            source_bytes = sizes.iter().sum::<u64>(),
            block_size = self.config.block_size,
            blocks = count,
            "sized target image"
        );
        Ok(count)
    }

    fn allocate(&mut self, block_count: u64) -> StageResult<()> {
        let dir = output_parent(&self.request.output);
        let name = self
            .request
            .output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "multiarch.img".to_string());
        let image = disk::allocate_image(&dir, &name, self.config.block_size, block_count)?;
        self.ledger.set_image(image);
        Ok(())
    }

    fn image_path(&self) -> StageResult<PathBuf> {
        self.ledger
            .image_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| StageError::io("target image", std::io::ErrorKind::NotFound.into()))
    }

    fn write_boot_sector(&mut self) -> StageResult<LoopBinding> {
        let image = self.image_path()?;
        let whole = self.ledger.loops.attach(&image, None)?;
        partitions::write_boot_sector(self.runner, &self.config.mbr_blob, &whole.device)?;
        Ok(whole)
    }

    /// Partition through the whole-device binding, then drop that binding
    /// so it never overlaps the partition binding.
    fn partition(&mut self, whole: &LoopBinding) -> StageResult<()> {
        let start_sector = self.config.partition_offset / SECTOR_SIZE;
        partitions::write_partition_table(self.runner, &whole.device, start_sector)?;
        self.ledger.loops.release(&whole.device)?;

        let image = self.image_path()?;
        let entry = partitions::verify_mbr(&image, &self.config.mbr_blob, start_sector)?;
        info!(
            start_lba = entry.start_lba,
            sectors = entry.sectors,
            "partition table verified"
        );
        Ok(())
    }

    fn format(&mut self) -> StageResult<LoopBinding> {
        let image = self.image_path()?;
        let partition = self
            .ledger
            .loops
            .attach(&image, Some(self.config.partition_offset))?;
        filesystem::format(self.runner, &partition.device)?;
        Ok(partition)
    }

    fn mount_target(&mut self, partition: &LoopBinding) -> StageResult<PathBuf> {
        let point = self.ledger.scratch_dir("target")?;
        self.ledger.mounts.mount(&partition.device, &point, None)?;
        Ok(point)
    }

    fn attach_sources(&mut self) -> StageResult<Vec<(String, LoopBinding)>> {
        let sources = self.request.sources.clone();
        sources
            .into_iter()
            .map(|source| {
                let binding = self.ledger.loops.attach(&source.image, None)?;
                Ok((source.arch, binding))
            })
            .collect()
    }

    fn mount_sources(&mut self, devices: &[(String, LoopBinding)]) -> StageResult<Vec<SourceTree>> {
        let mut trees = Vec::with_capacity(devices.len());
        for (arch, binding) in devices {
            let point = self.ledger.scratch_dir(&format!("source-{}", arch))?;
            self.ledger.mounts.mount(&binding.device, &point, Some("ro"))?;
            trees.push(SourceTree {
                arch: arch.clone(),
                root: point,
            });
        }
        Ok(trees)
    }

    fn stage_payloads(&mut self, trees: &[SourceTree], target: &Path) -> StageResult<Vec<BootEntry>> {
        let staging = self.ledger.scratch_dir("staging")?;
        let copier = PayloadCopier::new(&self.config.layout, &staging, self.config.verify_payloads);
        let entries = copier.copy_all(trees, target)?;
        fs::remove_dir(&staging)
            .map_err(|e| StageError::io(format!("removing '{}'", staging.display()), e))?;
        Ok(entries)
    }

    fn configure_boot(
        &mut self,
        partition: &LoopBinding,
        target: &Path,
        entries: &[BootEntry],
    ) -> StageResult<String> {
        let uuid = boot::uuid_of(self.runner, &partition.device)?;
        let boot_dir = target.join(&self.config.layout.target_boot_dir);
        boot::install(self.runner, &boot_dir)?;
        boot::write_config(
            &boot_dir.join(boot::CONFIG_FILENAME),
            &self.config.menu,
            &uuid,
            entries,
        )?;
        Ok(uuid)
    }

    /// Remove scratch space, then rename the finished image over the output.
    fn finalize(&mut self) -> StageResult<u64> {
        self.ledger.remove_scratch()?;
        let image = self
            .ledger
            .take_image()
            .ok_or_else(|| StageError::io("target image", std::io::ErrorKind::NotFound.into()))?;
        let output = &self.request.output;
        image.persist(output).map_err(|e| {
            StageError::io(format!("moving image to '{}'", output.display()), e.error)
        })?;
        let bytes = fs::metadata(output)
            .map_err(|e| StageError::io(format!("reading '{}'", output.display()), e))?
            .len();
        Ok(bytes)
    }
}

fn output_parent(output: &Path) -> PathBuf {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
