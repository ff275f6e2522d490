//! Error types for the image build.
//!
//! Errors are split by when they can happen:
//! - [`UsageError`]: bad arguments, detected before any host resource is touched
//! - [`StageError`]: an operational failure inside a pipeline stage
//!
//! [`BuildError`] wraps both and attaches the [`Stage`] that failed, so the
//! caller can report which step broke and with which tool.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::Stage;

pub type StageResult<T> = std::result::Result<T, StageError>;

// ============================================================================
// Top-Level Error
// ============================================================================

#[derive(Debug, Error)]
pub enum BuildError {
    /// Arguments were missing or invalid (user-fixable, nothing was acquired).
    #[error("usage: {0}")]
    Usage(#[from] UsageError),

    /// A pipeline stage failed after the run had started.
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },
}

/// Coarse classification used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    ResourceAcquisition,
    ExternalTool,
    PayloadLayout,
    Interrupted,
    Io,
}

impl BuildError {
    pub fn stage(stage: Stage, source: StageError) -> Self {
        BuildError::Stage { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Usage(_) => ErrorKind::Usage,
            BuildError::Stage { source, .. } => source.kind(),
        }
    }

    /// Stage the run was in when it failed (`None` for usage errors).
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            BuildError::Usage(_) => None,
            BuildError::Stage { stage, .. } => Some(*stage),
        }
    }
}

// ============================================================================
// Usage Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("expected at least two source images, got {0}")]
    TooFewSources(usize),

    #[error("source image '{}' does not exist", .0.display())]
    MissingSource(PathBuf),

    #[error("source image '{}' is not a regular file", .0.display())]
    SourceNotAFile(PathBuf),

    #[error("no output image path given")]
    MissingOutput,

    #[error("output directory '{}' does not exist", .0.display())]
    OutputDirMissing(PathBuf),

    #[error("output path '{}' is also a source image", .0.display())]
    OutputIsSource(PathBuf),

    #[error("{sources} source images but only {labels} architecture labels configured")]
    NotEnoughLabels { sources: usize, labels: usize },

    #[error("invalid architecture label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("invalid build configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Stage Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StageError {
    #[error("no free loop device available")]
    NoFreeDevice,

    #[error("binding '{}' to {device}: {reason}", .file.display())]
    Bind {
        device: String,
        file: PathBuf,
        reason: String,
    },

    #[error("no loop device backs '{}'", .0.display())]
    NotBound(PathBuf),

    #[error(
        "not enough space in '{}': need {needed} bytes, {available} available",
        .dir.display()
    )]
    InsufficientSpace {
        dir: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("allocating '{}': expected {expected} bytes, got {actual}", .path.display())]
    Allocation {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("mounting {device} at '{}': {reason}", .mount_point.display())]
    Mount {
        device: String,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("payload file '{}' is missing from the source image", .0.display())]
    Payload(PathBuf),

    #[error("copy of '{}' does not match its source ({detail})", .path.display())]
    PayloadMismatch { path: PathBuf, detail: String },

    #[error("no filesystem UUID reported for {0}")]
    MissingUuid(String),

    #[error("boot sector of '{}': {reason}", .path.display())]
    BootSector { path: PathBuf, reason: String },

    #[error("missing required host tools:\n{0}")]
    MissingTools(String),

    #[error("must run as root (effective uid {0})")]
    NotPrivileged(u32),

    #[error("interrupted by signal")]
    Interrupted,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl StageError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StageError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::NoFreeDevice
            | StageError::Bind { .. }
            | StageError::NotBound(_)
            | StageError::InsufficientSpace { .. }
            | StageError::Allocation { .. }
            | StageError::MissingTools(_)
            | StageError::NotPrivileged(_) => ErrorKind::ResourceAcquisition,
            StageError::Tool(_)
            | StageError::Mount { .. }
            | StageError::MissingUuid(_)
            | StageError::BootSector { .. } => ErrorKind::ExternalTool,
            StageError::Payload(_) | StageError::PayloadMismatch { .. } => {
                ErrorKind::PayloadLayout
            }
            StageError::Interrupted => ErrorKind::Interrupted,
            StageError::Io { .. } => ErrorKind::Io,
        }
    }
}

// ============================================================================
// External Tool Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The program ran and exited unsuccessfully.
    #[error("{message}: `{command}` exited with {status}{}", stderr_suffix(.stderr))]
    Failed {
        message: String,
        command: String,
        status: ExitStatusDisplay,
        stderr: String,
    },
}

/// Exit code, or `signal` when the child was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusDisplay(pub Option<i32>);

impl fmt::Display for ExitStatusDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "status {}", code),
            None => write!(f, "a signal"),
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{}", trimmed)
    }
}
