use thiserror::Error;

/// Errors surfaced to callers of the engine's programmatic surface.
///
/// Fault-channel and store I/O failures are not represented here: per the
/// engine's error handling design, those are fatal and abort the process
/// from the worker that observed them rather than propagating.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("address {0:#x} is not page-aligned")]
    UnalignedAddress(usize),

    #[error("region [{0:#x}, {1:#x}) overlaps an existing region")]
    OverlappingRegion(usize, usize),

    #[error("map flags must include PRIVATE")]
    MissingPrivateFlag,

    #[error("page size {0} is smaller than the system page size {1}")]
    PageSizeTooSmall(usize, usize),

    #[error("no region contains address {0:#x}")]
    NoSuchRegion(usize),

    #[error("configuration cannot change while {0} region(s) are active")]
    ConfigurationLocked(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
