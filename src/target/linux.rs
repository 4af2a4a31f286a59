mod discovery;
mod local;
mod memory;
mod readmem;
mod requests;
mod vm;
pub mod word;
mod writemem;

pub use discovery::{loaded_images, LoadedImage, Segment};
pub use local::LocalMemory;
pub use memory::{split_protected, MemoryOp, PAGE_SIZE};
pub use readmem::ReadMemory;
pub use requests::{traceme, Options, Request, SUSPEND_SECCOMP};
pub use vm::{check_spans, read_spans, write_spans, MemorySpan};
pub use writemem::WriteMemory;

use crate::{MemError, MemResult};
use nix::{
    sys::{
        ptrace,
        signal::{self, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};
use procfs::process::{MMPermissions, MMapPath};

#[cfg(target_arch = "x86_64")]
use super::RegisterSet;

/// Where a tracee is in its trace lifecycle, as last observed by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Detached,
    Stopped,
    Running,
}

/// How to set up a trace attachment.
#[derive(Debug, Clone, Copy)]
pub struct AttachOptions {
    /// Kill the tracee if the tracer exits without detaching.
    pub kill_on_exit: bool,
    /// Events that should stop the tracee.
    pub options: Options,
}

impl Default for AttachOptions {
    fn default() -> Self {
        AttachOptions {
            kill_on_exit: false,
            options: Options::empty(),
        }
    }
}

impl AttachOptions {
    fn bits(&self) -> Options {
        if self.kill_on_exit {
            self.options | Options::PTRACE_O_EXITKILL
        } else {
            self.options
        }
    }
}

/// A process traced by the calling thread.
///
/// All requests must come from the thread that attached. Dropping a `Tracee` that is still
/// attached detaches it.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    state: TraceState,
    seized: bool,
    options: Options,
}

impl Tracee {
    /// Attaches to `pid` and waits until it stops.
    pub fn attach(pid: Pid, opts: AttachOptions) -> MemResult<(Tracee, WaitStatus)> {
        ptrace::attach(pid).map_err(Request::Attach.fail(pid, 0))?;
        tracing::debug!("attached to {}", pid);

        let mut tracee = Tracee::new(pid, false);
        let status = tracee.wait()?;
        tracee.set_options(opts.bits())?;
        Ok((tracee, status))
    }

    /// Attaches to `pid` without stopping it.
    pub fn seize(pid: Pid, opts: AttachOptions) -> MemResult<Tracee> {
        ptrace::seize(pid, opts.bits()).map_err(Request::Seize.fail(pid, 0))?;
        tracing::debug!("seized {}", pid);

        let mut tracee = Tracee::new(pid, true);
        tracee.options = opts.bits();
        Ok(tracee)
    }

    /// Takes over a child that called [`traceme`], waiting for its first stop.
    pub fn adopt(pid: Pid) -> MemResult<(Tracee, WaitStatus)> {
        let mut tracee = Tracee::new(pid, false);
        let status = tracee.wait()?;
        Ok((tracee, status))
    }

    fn new(pid: Pid, seized: bool) -> Self {
        Tracee {
            pid,
            state: TraceState::Running,
            seized,
            options: Options::empty(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn options(&self) -> Options {
        self.options
    }

    fn require_stopped(&self) -> MemResult<()> {
        match self.state {
            TraceState::Stopped => Ok(()),
            state => Err(MemError::NotStopped {
                pid: self.pid,
                state,
            }),
        }
    }

    /// Waits for the next state change of the tracee.
    pub fn wait(&mut self) -> MemResult<WaitStatus> {
        let status = waitpid(self.pid, None).map_err(|source| MemError::Wait {
            pid: self.pid,
            source,
        })?;

        self.state = match status {
            WaitStatus::Stopped(..) | WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_) => {
                TraceState::Stopped
            }
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => TraceState::Detached,
            _ => TraceState::Running,
        };
        tracing::trace!("{} changed state: {:?}", self.pid, status);
        Ok(status)
    }

    /// Replaces the event-filter options.
    pub fn set_options(&mut self, options: Options) -> MemResult<()> {
        if options == self.options {
            return Ok(());
        }
        ptrace::setoptions(self.pid, options).map_err(Request::SetOptions.fail(self.pid, 0))?;
        tracing::debug!("set trace options of {} to {:?}", self.pid, options);
        self.options = options;
        Ok(())
    }

    /// Stops a seized tracee and waits for the stop.
    pub fn interrupt(&mut self) -> MemResult<WaitStatus> {
        ptrace::interrupt(self.pid).map_err(Request::Interrupt.fail(self.pid, 0))?;
        self.wait()
    }

    /// Resumes the tracee, delivering `sig` if given. Does not wait.
    pub fn cont(&mut self, sig: Option<Signal>) -> MemResult<()> {
        self.require_stopped()?;
        ptrace::cont(self.pid, sig).map_err(Request::Cont.fail(self.pid, 0))?;
        self.state = TraceState::Running;
        Ok(())
    }

    /// Resumes the tracee until the next system call entry or exit.
    pub fn syscall(&mut self, sig: Option<Signal>) -> MemResult<WaitStatus> {
        self.require_stopped()?;
        ptrace::syscall(self.pid, sig).map_err(Request::Syscall.fail(self.pid, 0))?;
        self.state = TraceState::Running;
        self.wait()
    }

    /// Executes a single instruction.
    pub fn step(&mut self, sig: Option<Signal>) -> MemResult<WaitStatus> {
        self.require_stopped()?;
        ptrace::step(self.pid, sig).map_err(Request::SingleStep.fail(self.pid, 0))?;
        self.state = TraceState::Running;
        self.wait()
    }

    /// Detaches from the tracee and lets it run.
    ///
    /// A running tracee is stopped first. Signals that arrive meanwhile are passed on.
    pub fn detach(&mut self) -> MemResult<()> {
        if self.state == TraceState::Running {
            self.stop_for_detach()?;
        }
        if self.state == TraceState::Detached {
            return Ok(());
        }

        ptrace::detach(self.pid, None).map_err(Request::Detach.fail(self.pid, 0))?;
        self.state = TraceState::Detached;
        tracing::debug!("detached from {}", self.pid);
        Ok(())
    }

    fn stop_for_detach(&mut self) -> MemResult<()> {
        if self.seized {
            ptrace::interrupt(self.pid).map_err(Request::Interrupt.fail(self.pid, 0))?;
        } else {
            signal::kill(self.pid, Signal::SIGSTOP).map_err(|source| MemError::Signal {
                pid: self.pid,
                signal: Signal::SIGSTOP,
                source,
            })?;
        }

        loop {
            match self.wait()? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => return Ok(()),
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) if self.seized => {
                    return Ok(())
                }
                WaitStatus::Stopped(_, sig) => self.cont(Some(sig))?,
                _ if self.state == TraceState::Detached => return Ok(()),
                _ if self.state == TraceState::Stopped => self.cont(None)?,
                _ => {}
            }
        }
    }

    /// Kills the tracee and reaps it.
    pub fn kill(&mut self) -> MemResult<WaitStatus> {
        ptrace::kill(self.pid).map_err(Request::Kill.fail(self.pid, 0))?;
        tracing::debug!("killed {}", self.pid);
        loop {
            let status = self.wait()?;
            match self.state {
                TraceState::Detached => return Ok(status),
                // E.g. an exit event stop.
                TraceState::Stopped => {
                    ptrace::cont(self.pid, None).map_err(Request::Cont.fail(self.pid, 0))?
                }
                TraceState::Running => {}
            }
        }
    }

    /// Reads the general purpose registers of a stopped tracee.
    #[cfg(target_arch = "x86_64")]
    pub fn registers(&self) -> MemResult<RegisterSet> {
        self.require_stopped()?;
        let regs = ptrace::getregs(self.pid).map_err(Request::GetRegs.fail(self.pid, 0))?;
        Ok(regs.into())
    }

    /// Writes the general purpose registers of a stopped tracee.
    #[cfg(target_arch = "x86_64")]
    pub fn set_registers(&self, regs: RegisterSet) -> MemResult<()> {
        self.require_stopped()?;
        ptrace::setregs(self.pid, regs.into()).map_err(Request::SetRegs.fail(self.pid, 0))
    }

    /// Reads a word of the user area at `offset`, in native byte order.
    pub fn peek_user(&self, offset: usize) -> MemResult<u64> {
        self.require_stopped()?;
        let word = ptrace::read_user(self.pid, offset as ptrace::AddressType)
            .map_err(Request::PeekUser.fail(self.pid, offset))?;
        Ok(word as u64)
    }

    /// Writes a word of the user area at `offset`, in native byte order.
    pub fn poke_user(&self, offset: usize, value: u64) -> MemResult<()> {
        self.require_stopped()?;
        ptrace::write_user(self.pid, offset as ptrace::AddressType, value as libc::c_long)
            .map_err(Request::PokeUser.fail(self.pid, offset))
    }

    /// Reads the memory word that the register at user-area `offset` points to.
    pub fn read_by_reg(&self, offset: usize) -> MemResult<word::Word> {
        let addr = self.peek_user(offset)?;
        word::peek(self.pid, addr as usize)
    }

    /// Like [`read_by_reg`](Tracee::read_by_reg), but returns the word in native byte order.
    pub fn read_by_reg_swapped(&self, offset: usize) -> MemResult<word::Word> {
        let addr = self.peek_user(offset)?;
        word::peek_swapped(self.pid, addr as usize)
    }

    /// Returns the message of the last ptrace event, e.g. the pid of a new child.
    pub fn event_msg(&self) -> MemResult<u64> {
        self.require_stopped()?;
        let msg = ptrace::getevent(self.pid).map_err(Request::GetEventMsg.fail(self.pid, 0))?;
        Ok(msg as u64)
    }

    pub fn peek(&self, addr: usize) -> MemResult<word::Word> {
        self.require_stopped()?;
        word::peek(self.pid, addr)
    }

    pub fn poke(&self, addr: usize, value: word::Word) -> MemResult<()> {
        self.require_stopped()?;
        word::poke(self.pid, addr, value)
    }

    /// Reads `len` bytes through the word channel.
    pub fn read(&self, addr: usize, len: usize) -> MemResult<Vec<u8>> {
        self.require_stopped()?;
        word::read(self.pid, addr, len)
    }

    /// Writes `data` through the word channel, ignoring page protection.
    pub fn write(&self, addr: usize, data: &[u8]) -> MemResult<()> {
        self.require_stopped()?;
        word::write(self.pid, addr, data)
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if self.state == TraceState::Detached {
            return;
        }
        tracing::warn!("tracee {} dropped while attached, detaching", self.pid);
        if let Err(err) = self.detach() {
            tracing::warn!("failed to detach from {}: {}", self.pid, err);
        }
    }
}

/// Reads the memory maps of `pid` from `/proc/<pid>/maps`.
pub fn memory_maps(pid: Pid) -> MemResult<Vec<super::MemoryMap>> {
    Ok(procfs::process::Process::new(pid.as_raw())?
        .maps()?
        .into_iter()
        .map(|map| super::MemoryMap {
            address: map.address,
            backing_file: match map.pathname {
                MMapPath::Path(path) => Some((path, map.offset)),
                _ => None,
            },
            is_private: map.perms.contains(MMPermissions::PRIVATE),
            is_readable: map.perms.contains(MMPermissions::READ),
            is_writable: map.perms.contains(MMPermissions::WRITE),
            is_executable: map.perms.contains(MMPermissions::EXECUTE),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{memory_maps, AttachOptions, Options, TraceState, Tracee};
    use crate::{ErrorKind, MemError};
    use nix::{
        sys::signal::Signal,
        unistd::{getpid, Pid},
    };

    #[test]
    fn exit_kill_is_added_on_request() {
        let opts = AttachOptions {
            kill_on_exit: true,
            options: Options::PTRACE_O_TRACESYSGOOD,
        };
        assert_eq!(
            opts.bits(),
            Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_EXITKILL
        );
        assert!(AttachOptions::default().bits().is_empty());
    }

    #[test]
    fn requests_need_a_stopped_tracee() {
        // Never attached: nothing is sent to the kernel and drop has nothing to undo.
        let mut tracee = Tracee::new(getpid(), false);
        tracee.state = TraceState::Detached;

        assert_eq!(tracee.peek(0x1000).unwrap_err().kind(), ErrorKind::Precondition);
        assert_eq!(tracee.cont(None).unwrap_err().kind(), ErrorKind::Precondition);
        assert_eq!(tracee.step(None).unwrap_err().kind(), ErrorKind::Precondition);
        assert!(tracee.detach().is_ok());
    }

    #[test]
    fn detach_reports_a_failed_stop_signal() {
        // Pid numbers are bounded well below this, so the stop signal cannot be delivered.
        let mut tracee = Tracee::new(Pid::from_raw(i32::MAX - 1), false);

        match tracee.detach().unwrap_err() {
            MemError::Signal { signal, .. } => assert_eq!(signal, Signal::SIGSTOP),
            err => panic!("unexpected error: {}", err),
        }
        tracee.state = TraceState::Detached;
    }

    #[test]
    fn attach_to_missing_process_fails() {
        // Pid numbers are bounded well below this.
        let err = Tracee::attach(Pid::from_raw(i32::MAX - 1), AttachOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Request);
    }

    #[test]
    fn own_maps_contain_stack_variable() {
        let var = 7u32;
        let addr = &var as *const u32 as usize;

        let maps = memory_maps(getpid()).expect("Failed to read maps");
        let map = maps
            .iter()
            .find(|map| map.contains(addr))
            .expect("stack is mapped");
        assert!(map.is_readable && map.is_writable);
    }
}
