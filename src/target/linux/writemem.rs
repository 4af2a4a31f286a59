use super::{
    memory::{next_step, page_chunks, split_protected, MemoryOp, NextStep, IOV_MAX},
    memory_maps,
    vm::{self, Direction},
    word,
};
use crate::{MemError, MemResult};
use nix::unistd::Pid;
use std::{marker::PhantomData, mem};

/// Allows to write data to different locations in a target's memory as a single operation.
/// This implementation can select different strategies for different memory pages.
pub struct WriteMemory<'a> {
    pid: Pid,
    write_ops: Vec<WriteOp>,
    ptrace_fallback: bool,
    _marker: PhantomData<&'a ()>,
}

impl<'a> WriteMemory<'a> {
    pub fn new(pid: Pid) -> Self {
        WriteMemory {
            pid,
            write_ops: Vec::new(),
            ptrace_fallback: false,
            _marker: PhantomData,
        }
    }

    /// Allows writing through ptrace when the fast path is denied or hits write-protected pages.
    /// The target must be traced by the calling thread and stopped.
    pub fn with_ptrace_fallback(mut self, enabled: bool) -> Self {
        self.ptrace_fallback = enabled;
        self
    }

    /// Queues a write of `val` to `remote_base`.
    pub fn write<T: ?Sized>(mut self, val: &'a T, remote_base: usize) -> Self {
        let op = WriteOp {
            remote_base,
            source_len: mem::size_of_val(val),
            source_ptr: val as *const T as *const libc::c_void,
        };
        self.write_ops.append(&mut op.split_on_page_boundary());
        self
    }

    /// Executes the memory write operation.
    ///
    /// # Safety
    ///
    /// Writing into another process can break its invariants in any way; when the target is the
    /// calling process, the destination must not alias live Rust references.
    pub unsafe fn apply(self) -> MemResult<()> {
        self.apply_with(write_process_vm)
    }

    unsafe fn apply_with(
        self,
        first_pass: impl FnOnce(Pid, &[&WriteOp]) -> MemResult<usize>,
    ) -> MemResult<()> {
        let write_len = self.write_ops.iter().map(|op| op.source_len).sum::<usize>();
        if write_len == 0 {
            return Ok(());
        }

        let ops = self.write_ops.iter().collect::<Vec<_>>();
        let addr = self.write_ops[0].remote_base;
        let result = first_pass(self.pid, &ops);

        match next_step(self.pid, addr, write_len, result, self.ptrace_fallback)? {
            NextStep::Done => return Ok(()),
            NextStep::Ptrace => return write_ptrace(self.pid, &ops),
            NextStep::Split { .. } => {}
        }

        // Each op lies within one page, so it is either fully writable or fully protected.
        let protected_maps = memory_maps(self.pid)?
            .into_iter()
            .filter(|map| !map.is_writable)
            .collect::<Vec<_>>();
        let (protected, writable) = split_protected(&protected_maps, self.write_ops.iter());
        tracing::debug!(
            "short write to pid {}: {} protected, {} writable chunks",
            self.pid,
            protected.len(),
            writable.len()
        );

        let writable_len = writable.iter().map(|op| op.source_len).sum::<usize>();
        let done = write_process_vm(self.pid, &writable)?;
        if done != writable_len {
            return Err(MemError::Partial {
                pid: self.pid,
                addr: writable.first().map_or(0, |op| op.remote_base),
                expected: writable_len,
                done,
            });
        }
        write_ptrace(self.pid, &protected)
    }
}

/// A single memory write operation.
pub(crate) struct WriteOp {
    // Remote destation location.
    remote_base: usize,
    // Pointer to a source.
    source_ptr: *const libc::c_void,
    // Size of `source_ptr`.
    source_len: usize,
}

impl WriteOp {
    /// Converts the memory write operation into a remote IoVec.
    fn as_remote_iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.remote_base as *const libc::c_void as *mut _,
            iov_len: self.source_len,
        }
    }

    /// Converts the memory write operation into a local IoVec.
    fn as_local_iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.source_ptr as *mut _,
            iov_len: self.source_len,
        }
    }

    /// Splits WriteOp so that each resulting WriteOp resides in only one memory page.
    fn split_on_page_boundary(&self) -> Vec<WriteOp> {
        page_chunks(self.remote_base, self.source_len)
            .into_iter()
            .map(|(offset, len)| WriteOp {
                remote_base: self.remote_base.wrapping_add(offset),
                source_ptr: (self.source_ptr as usize + offset) as *const libc::c_void,
                source_len: len,
            })
            .collect()
    }

    fn source(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.source_ptr as *const u8, self.source_len) }
    }
}

impl MemoryOp for WriteOp {
    fn remote_base(&self) -> usize {
        self.remote_base
    }
}

/// Allows to write to write-protected pages.
/// On Linux, this will result in multiple system calls and it's inefficient.
fn write_ptrace(pid: Pid, write_ops: &[&WriteOp]) -> MemResult<()> {
    for op in write_ops {
        word::write(pid, op.remote_base, op.source())?;
    }
    Ok(())
}

/// Allows to write data to different locations in a target's memory as a single operation.
/// It requires a memory page to be writable.
fn write_process_vm(pid: Pid, write_ops: &[&WriteOp]) -> MemResult<usize> {
    let mut total = 0;

    for chunk in write_ops.chunks(*IOV_MAX) {
        let remote_iov = chunk.iter().map(|op| op.as_remote_iovec()).collect::<Vec<_>>();
        let local_iov = chunk.iter().map(|op| op.as_local_iovec()).collect::<Vec<_>>();
        let expected = chunk.iter().map(|op| op.source_len).sum::<usize>();

        let done = unsafe { vm::transfer(pid, Direction::Write, &local_iov, &remote_iov)? };
        total += done;
        if done != expected {
            break;
        }
    }
    Ok(total)
}
