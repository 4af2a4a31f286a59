use nix::unistd::Pid;
use thiserror::Error;

#[cfg(target_os = "linux")]
use crate::target::{Request, TraceState};

/// Coarse classification of a [`MemError`], used to decide on recovery without matching
/// on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A trace-control request was rejected by the kernel.
    Request,
    /// Invalid arguments or state, detected before any system call was made.
    Precondition,
    /// The fast path is not permitted or not available. Retrying through the word channel may succeed.
    Denied,
    /// The target memory could not be accessed in full.
    Access,
}

#[derive(Error, Debug)]
pub enum MemError {
    #[cfg(target_os = "linux")]
    #[error("ptrace({request}) failed for pid {pid} at {addr:#x}: {source}")]
    Request {
        request: Request,
        pid: Pid,
        addr: usize,
        #[source]
        source: nix::Error,
    },

    #[error("waiting for pid {pid} failed: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("sending {signal:?} to pid {pid} failed: {source}")]
    Signal {
        pid: Pid,
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[cfg(target_os = "linux")]
    #[error("tracee {pid} must be stopped, but is {state:?}")]
    NotStopped { pid: Pid, state: TraceState },

    #[error("access of {len} bytes at offset {offset} is outside of a {size} byte buffer")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("offset {offset} is not aligned to {align} bytes")]
    Misaligned { offset: usize, align: usize },

    #[error("offset {offset:#x} overflows the address space from base {base:#x}")]
    AddressOverflow { base: usize, offset: usize },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("vectored memory access to pid {pid} denied: {source}")]
    Denied {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("cannot access {len} bytes at {addr:#x} in pid {pid}: {source}")]
    Fault {
        pid: Pid,
        addr: usize,
        len: usize,
        #[source]
        source: nix::Error,
    },

    #[error("transferred {done} of {expected} bytes at {addr:#x} in pid {pid}")]
    Partial {
        pid: Pid,
        addr: usize,
        expected: usize,
        done: usize,
    },

    #[cfg(target_os = "linux")]
    #[error("Error occurred while reading /proc: {0}")]
    ProcFs(#[from] procfs::ProcError),
}

impl MemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            #[cfg(target_os = "linux")]
            MemError::Request { .. } => ErrorKind::Request,
            MemError::Wait { .. } | MemError::Signal { .. } => ErrorKind::Request,
            MemError::Precondition(_)
            | MemError::OutOfBounds { .. }
            | MemError::Misaligned { .. }
            | MemError::AddressOverflow { .. }
            | MemError::Unsupported(_) => ErrorKind::Precondition,
            #[cfg(target_os = "linux")]
            MemError::NotStopped { .. } => ErrorKind::Precondition,
            MemError::Denied { .. } => ErrorKind::Denied,
            MemError::Fault { .. } | MemError::Partial { .. } => ErrorKind::Access,
            #[cfg(target_os = "linux")]
            MemError::ProcFs(_) => ErrorKind::Access,
        }
    }

    /// Returns `true` when the word channel is a viable fallback for this error.
    pub fn is_denied(&self) -> bool {
        self.kind() == ErrorKind::Denied
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        MemError::Precondition(msg.into())
    }
}
