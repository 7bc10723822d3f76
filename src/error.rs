//! Fault taxonomy for the readout card core
//!
//! Every component fails with the most specific [`Error`] variant it can name.
//! Refinement families (parameter, lock, unsafe access, C-RORC handshake) are
//! nested enums so a caller can match on the family or on the exact step.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Root fault type
#[derive(Debug, Error)]
pub enum Error {
    /// PCI/DMA mapping facility failure (card resource missing, not accessible)
    #[error("PDA error: {0}")]
    Pda(String),

    #[error("memory map error: {0}")]
    MemoryMap(String),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{what} out of range: {value} (accepted {min}..{max})")]
    OutOfRange {
        what: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("device finder error: {0}")]
    DeviceFinder(String),

    #[error("shared state error: {0}")]
    SharedState(String),

    #[error("shared object not found: {}", .0.display())]
    SharedObjectNotFound(PathBuf),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    UnsafeAccess(#[from] UnsafeAccess),

    #[error("invalid link id {link} for {card}")]
    InvalidLinkId { link: u32, card: String },

    #[error(transparent)]
    Crorc(#[from] CrorcError),

    #[error("CRU error: {0}")]
    Cru(String),

    /// Generation agnostic card failure
    #[error("card error: {0}")]
    Card(String),
}

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("parameter error: {0}")]
    Generic(String),
    #[error("invalid parameter: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock error: {0}")]
    Generic(String),
    #[error("file lock error on {}: {message}", .path.display())]
    File { path: PathBuf, message: String },
    #[error("socket lock error on {name}: {message}")]
    Socket { name: String, message: String },
}

/// Access outside the range validated as safely mapped
#[derive(Debug, Error)]
pub enum UnsafeAccess {
    #[error("unsafe read at offset {offset:#x} (mapped size {size:#x})")]
    Read { offset: usize, size: usize },
    #[error("unsafe write at offset {offset:#x} (mapped size {size:#x})")]
    Write { offset: usize, size: usize },
}

/// C-RORC handshake step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrorcStep {
    ArmDataGenerator,
    ArmDdl,
    InitDiu,
    CheckLink,
    SiuCommand,
    DiuCommand,
    SiuLoopback,
    FreeFifo,
    StartDataGenerator,
    StartTrigger,
    StopTrigger,
    DataArrival,
}

impl fmt::Display for CrorcStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrorcStep::ArmDataGenerator => "arm data generator",
            CrorcStep::ArmDdl => "arm DDL",
            CrorcStep::InitDiu => "init DIU",
            CrorcStep::CheckLink => "check link",
            CrorcStep::SiuCommand => "SIU command",
            CrorcStep::DiuCommand => "DIU command",
            CrorcStep::SiuLoopback => "SIU loopback",
            CrorcStep::FreeFifo => "free FIFO",
            CrorcStep::StartDataGenerator => "start data generator",
            CrorcStep::StartTrigger => "start trigger",
            CrorcStep::StopTrigger => "stop trigger",
            CrorcStep::DataArrival => "data arrival",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("C-RORC {step} failed: {message}")]
pub struct CrorcError {
    pub step: CrorcStep,
    pub message: String,
}

impl CrorcError {
    pub fn new(step: CrorcStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

/// Flat discriminant naming the most specific kind of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Pda,
    MemoryMap,
    Parameter,
    InvalidParameter,
    Parse,
    OutOfRange,
    Lock,
    FileLock,
    SocketLock,
    DeviceFinder,
    SharedState,
    SharedObjectNotFound,
    Timeout,
    UnsafeRead,
    UnsafeWrite,
    InvalidLinkId,
    Crorc(CrorcStep),
    Cru,
    Card,
}

impl Error {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Error::Parameter(ParameterError::Invalid(message.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Pda(_) => ErrorKind::Pda,
            Error::MemoryMap(_) => ErrorKind::MemoryMap,
            Error::Parameter(ParameterError::Generic(_)) => ErrorKind::Parameter,
            Error::Parameter(ParameterError::Invalid(_)) => ErrorKind::InvalidParameter,
            Error::Parse(_) => ErrorKind::Parse,
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::Lock(LockError::Generic(_)) => ErrorKind::Lock,
            Error::Lock(LockError::File { .. }) => ErrorKind::FileLock,
            Error::Lock(LockError::Socket { .. }) => ErrorKind::SocketLock,
            Error::DeviceFinder(_) => ErrorKind::DeviceFinder,
            Error::SharedState(_) => ErrorKind::SharedState,
            Error::SharedObjectNotFound(_) => ErrorKind::SharedObjectNotFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::UnsafeAccess(UnsafeAccess::Read { .. }) => ErrorKind::UnsafeRead,
            Error::UnsafeAccess(UnsafeAccess::Write { .. }) => ErrorKind::UnsafeWrite,
            Error::InvalidLinkId { .. } => ErrorKind::InvalidLinkId,
            Error::Crorc(e) => ErrorKind::Crorc(e.step),
            Error::Cru(_) => ErrorKind::Cru,
            Error::Card(_) => ErrorKind::Card,
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self, Error::Parameter(_))
    }

    pub fn is_lock(&self) -> bool {
        matches!(self, Error::Lock(_))
    }

    pub fn is_unsafe_access(&self) -> bool {
        matches!(self, Error::UnsafeAccess(_))
    }

    pub fn is_crorc(&self) -> bool {
        matches!(self, Error::Crorc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_most_specific_refinement() {
        let e = Error::invalid_parameter("offset 0x1001 is not word aligned");
        assert_eq!(e.kind(), ErrorKind::InvalidParameter);
        assert!(e.is_parameter());

        let e = Error::from(LockError::Socket {
            name: "roc_04:00.0_1".into(),
            message: "address in use".into(),
        });
        assert_eq!(e.kind(), ErrorKind::SocketLock);
        assert!(e.is_lock());
        assert!(!e.is_parameter());

        let e = Error::from(UnsafeAccess::Write { offset: 0x100, size: 0x100 });
        assert_eq!(e.kind(), ErrorKind::UnsafeWrite);
        assert!(e.is_unsafe_access());
    }

    #[test]
    fn crorc_errors_carry_their_step() {
        let e = Error::from(CrorcError::new(CrorcStep::DataArrival, "status 0x80000082"));
        assert_eq!(e.kind(), ErrorKind::Crorc(CrorcStep::DataArrival));
        assert!(e.is_crorc());
        assert_eq!(e.to_string(), "C-RORC data arrival failed: status 0x80000082");
    }

    #[test]
    fn messages_include_context() {
        let e = Error::from(UnsafeAccess::Read { offset: 0x1000, size: 0x100 });
        assert_eq!(e.to_string(), "unsafe read at offset 0x1000 (mapped size 0x100)");

        let e = Error::SharedObjectNotFound(PathBuf::from("/dev/shm/readoutcard/x.lock"));
        assert_eq!(e.to_string(), "shared object not found: /dev/shm/readoutcard/x.lock");
    }
}
