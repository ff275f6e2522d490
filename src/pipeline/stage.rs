use std::fmt;

/// Pipeline states, in execution order. `Aborting` is entered from any
/// state on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preflight,
    Sizing,
    Allocating,
    BootSectorWrite,
    Partitioning,
    Formatting,
    MountingTarget,
    AttachingSources,
    MountingSources,
    StagingPayloads,
    ConfiguringBoot,
    Unmounting,
    Detaching,
    Finalizing,
    Done,
    Aborting,
}

impl Stage {
    /// The success path, in order.
    pub const SEQUENCE: [Stage; 15] = [
        Stage::Preflight,
        Stage::Sizing,
        Stage::Allocating,
        Stage::BootSectorWrite,
        Stage::Partitioning,
        Stage::Formatting,
        Stage::MountingTarget,
        Stage::AttachingSources,
        Stage::MountingSources,
        Stage::StagingPayloads,
        Stage::ConfiguringBoot,
        Stage::Unmounting,
        Stage::Detaching,
        Stage::Finalizing,
        Stage::Done,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
