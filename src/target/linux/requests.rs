//! Trace-control request codes and event-filter options.

use crate::{MemError, MemResult};
use nix::{sys::ptrace, unistd::Pid};
use std::fmt;

pub use nix::sys::ptrace::Options;

/// Keep seccomp filters suspended while the tracee is traced.
pub const SUSPEND_SECCOMP: Options = Options::from_bits_retain(1 << 21);

/// Trace-control requests. Discriminants are the kernel ABI request numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Request {
    TraceMe = 0,
    PeekText = 1,
    PeekData = 2,
    PeekUser = 3,
    PokeText = 4,
    PokeData = 5,
    PokeUser = 6,
    Cont = 7,
    Kill = 8,
    SingleStep = 9,
    GetRegs = 12,
    SetRegs = 13,
    GetFpRegs = 14,
    SetFpRegs = 15,
    Attach = 16,
    Detach = 17,
    GetFpxRegs = 18,
    SetFpxRegs = 19,
    Syscall = 24,
    SetOptions = 0x4200,
    GetEventMsg = 0x4201,
    GetSigInfo = 0x4202,
    SetSigInfo = 0x4203,
    GetRegSet = 0x4204,
    SetRegSet = 0x4205,
    Seize = 0x4206,
    Interrupt = 0x4207,
    Listen = 0x4208,
}

impl Request {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Request::TraceMe => "PTRACE_TRACEME",
            Request::PeekText => "PTRACE_PEEKTEXT",
            Request::PeekData => "PTRACE_PEEKDATA",
            Request::PeekUser => "PTRACE_PEEKUSER",
            Request::PokeText => "PTRACE_POKETEXT",
            Request::PokeData => "PTRACE_POKEDATA",
            Request::PokeUser => "PTRACE_POKEUSER",
            Request::Cont => "PTRACE_CONT",
            Request::Kill => "PTRACE_KILL",
            Request::SingleStep => "PTRACE_SINGLESTEP",
            Request::GetRegs => "PTRACE_GETREGS",
            Request::SetRegs => "PTRACE_SETREGS",
            Request::GetFpRegs => "PTRACE_GETFPREGS",
            Request::SetFpRegs => "PTRACE_SETFPREGS",
            Request::Attach => "PTRACE_ATTACH",
            Request::Detach => "PTRACE_DETACH",
            Request::GetFpxRegs => "PTRACE_GETFPXREGS",
            Request::SetFpxRegs => "PTRACE_SETFPXREGS",
            Request::Syscall => "PTRACE_SYSCALL",
            Request::SetOptions => "PTRACE_SETOPTIONS",
            Request::GetEventMsg => "PTRACE_GETEVENTMSG",
            Request::GetSigInfo => "PTRACE_GETSIGINFO",
            Request::SetSigInfo => "PTRACE_SETSIGINFO",
            Request::GetRegSet => "PTRACE_GETREGSET",
            Request::SetRegSet => "PTRACE_SETREGSET",
            Request::Seize => "PTRACE_SEIZE",
            Request::Interrupt => "PTRACE_INTERRUPT",
            Request::Listen => "PTRACE_LISTEN",
        }
    }

    /// Wraps a kernel error into a [`MemError::Request`] naming this request.
    pub(crate) fn fail(self, pid: Pid, addr: usize) -> impl FnOnce(nix::Error) -> MemError {
        move |source| MemError::Request {
            request: self,
            pid,
            addr,
            source,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Makes the calling process a tracee of its parent.
///
/// Meant to be called in a freshly forked child; the parent then picks it up with
/// [`Tracee::adopt`](super::Tracee::adopt).
pub fn traceme() -> MemResult<()> {
    ptrace::traceme().map_err(Request::TraceMe.fail(nix::unistd::getpid(), 0))
}
