//! Memcrab, uniform access to the memory of live processes.
//!
//! A [`Process`](process::Process) reads and writes memory through one of three backends:
//! the ptrace word channel, the scatter/gather `process_vm_*` channel, or direct loads and
//! stores when the target is the calling process itself.

pub mod error;

pub use error::{ErrorKind, MemError};

pub type MemResult<T> = Result<T, MemError>;

/// Raw byte buffers and typed scalar accessors.
pub mod buffer;

/// Functions to work with target processes: tracing control, memory channels, module discovery.
pub mod target;

#[cfg(target_os = "linux")]
pub mod module;
#[cfg(target_os = "linux")]
pub mod process;
