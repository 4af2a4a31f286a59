use super::{
    memory::{next_step, page_chunks, split_protected, MemoryOp, NextStep, IOV_MAX},
    memory_maps,
    vm::{self, Direction},
    word,
};
use crate::{MemError, MemResult};
use nix::unistd::Pid;
use std::{marker::PhantomData, mem};

/// Allows to read memory from different locations in a target's memory as a single operation.
///
/// Reads are split on page boundaries and executed with one scatter/gather call. If that call
/// comes up short and ptrace fallback is enabled, pages that the kernel reports as unreadable
/// are read word by word through ptrace instead.
pub struct ReadMemory<'a> {
    pid: Pid,
    read_ops: Vec<ReadOp>,
    ptrace_fallback: bool,
    /// This requires a mutable reference because we rewrite values of variables in `ReadOp`.
    _marker: PhantomData<&'a mut ()>,
}

impl<'a> ReadMemory<'a> {
    pub fn new(pid: Pid) -> Self {
        ReadMemory {
            pid,
            read_ops: Vec::new(),
            ptrace_fallback: false,
            _marker: PhantomData,
        }
    }

    /// Allows reading through ptrace when the fast path is denied or hits protected pages.
    /// The target must be traced by the calling thread and stopped.
    pub fn with_ptrace_fallback(mut self, enabled: bool) -> Self {
        self.ptrace_fallback = enabled;
        self
    }

    /// Reads a value of type `T` from the target's memory at location `remote_base`.
    /// This value will be written to the provided variable `val`.
    /// You should call `apply` in order to execute the memory read operation.
    /// The provided variable `val` can't be accessed until either `apply` is called or `self` is
    /// dropped.
    ///
    /// # Safety
    ///
    /// The type `T` must not have any invalid values.
    /// For example, `T` must not be a `bool`, as `transmute::<u8, bool>(2)` is not a valid value for a bool.
    /// In case of doubt, wrap the type in [`mem::MaybeUninit`].
    pub unsafe fn read<T>(self, val: &'a mut T, remote_base: usize) -> Self {
        self.push(val as *mut T as *mut u8, mem::size_of::<T>(), remote_base)
    }

    /// Reads `buf.len()` bytes from the target's memory at location `remote_base` into `buf`.
    pub fn read_slice(self, buf: &'a mut [u8], remote_base: usize) -> Self {
        self.push(buf.as_mut_ptr(), buf.len(), remote_base)
    }

    fn push(mut self, local_ptr: *mut u8, len: usize, remote_base: usize) -> Self {
        let op = ReadOp {
            remote_base,
            len,
            local_ptr: local_ptr as *mut libc::c_void,
        };
        self.read_ops.append(&mut op.split_on_page_boundary());
        self
    }

    /// Executes the memory read operation.
    ///
    /// Either every queued byte is read or an error is returned.
    pub fn apply(self) -> MemResult<()> {
        self.apply_with(|this, ops| this.read_process_vm(ops))
    }

    fn apply_with(
        self,
        first_pass: impl FnOnce(&Self, &[&ReadOp]) -> MemResult<usize>,
    ) -> MemResult<()> {
        let read_len = self.read_ops.iter().map(|op| op.len).sum::<usize>();
        if read_len == 0 {
            return Ok(());
        }
        if read_len > isize::MAX as usize {
            return Err(MemError::precondition("read size too big"));
        }

        let ops = self.read_ops.iter().collect::<Vec<_>>();
        let addr = self.read_ops[0].remote_base;
        let result = first_pass(&self, &ops);

        match next_step(self.pid, addr, read_len, result, self.ptrace_fallback)? {
            NextStep::Done => return Ok(()),
            NextStep::Ptrace => return self.read_ptrace(&ops),
            NextStep::Split { .. } => {}
        }

        let (protected, readable) = self.split_protected(&self.read_ops)?;
        tracing::debug!(
            "short read from pid {}: {} protected, {} readable chunks",
            self.pid,
            protected.len(),
            readable.len()
        );

        let readable_len = readable.iter().map(|op| op.len).sum::<usize>();
        let done = self.read_process_vm(&readable)?;
        if done != readable_len {
            return Err(MemError::Partial {
                pid: self.pid,
                addr: readable.first().map_or(0, |op| op.remote_base),
                expected: readable_len,
                done,
            });
        }
        self.read_ptrace(&protected)
    }

    /// Allows to read from several different locations with one system call per `IOV_MAX` chunks.
    /// It will stop at pages that are not readable. Returns number of bytes read at granularity of ReadOps.
    fn read_process_vm(&self, read_ops: &[&ReadOp]) -> MemResult<usize> {
        let mut total = 0;

        for chunk in read_ops.chunks(*IOV_MAX) {
            let remote_iov = chunk.iter().map(|op| op.as_remote_iovec()).collect::<Vec<_>>();
            let local_iov = chunk.iter().map(|op| op.as_local_iovec()).collect::<Vec<_>>();
            let expected = chunk.iter().map(|op| op.len).sum::<usize>();

            // The local buffers are borrowed mutably for `'a` by this builder.
            let done = unsafe { vm::transfer(self.pid, Direction::Read, &local_iov, &remote_iov)? };
            total += done;
            if done != expected {
                break;
            }
        }
        Ok(total)
    }

    /// Splits readOps to those that read from read protected memory and those that do not.
    fn split_protected<'r>(
        &self,
        read_ops: &'r [ReadOp],
    ) -> MemResult<(Vec<&'r ReadOp>, Vec<&'r ReadOp>)> {
        let protected_maps = memory_maps(self.pid)?
            .into_iter()
            .filter(|map| !map.is_readable)
            .collect::<Vec<_>>();

        Ok(split_protected(&protected_maps, read_ops.iter()))
    }

    /// Allows to read from protected memory pages.
    /// This operation results in multiple system calls and is inefficient.
    fn read_ptrace(&self, read_ops: &[&ReadOp]) -> MemResult<()> {
        for read_op in read_ops {
            // The local buffer is borrowed mutably for `'a` by this builder.
            let local = unsafe {
                std::slice::from_raw_parts_mut(read_op.local_ptr as *mut u8, read_op.len)
            };
            word::read_into(self.pid, read_op.remote_base, local)?;
        }
        Ok(())
    }
}

/// A single memory read operation.
struct ReadOp {
    // Remote memory location.
    remote_base: usize,
    // Size of the `local_ptr` buffer.
    len: usize,
    // Pointer to a local destination buffer.
    local_ptr: *mut libc::c_void,
}

impl ReadOp {
    /// Converts the memory read operation into a remote IoVec.
    fn as_remote_iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.remote_base as *const libc::c_void as *mut _,
            iov_len: self.len,
        }
    }

    /// Converts the memory read operation into a local IoVec.
    fn as_local_iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.local_ptr,
            iov_len: self.len,
        }
    }

    /// Splits ReadOp so that each resulting ReadOp resides in only one memory page.
    fn split_on_page_boundary(&self) -> Vec<ReadOp> {
        page_chunks(self.remote_base, self.len)
            .into_iter()
            .map(|(offset, len)| ReadOp {
                remote_base: self.remote_base.wrapping_add(offset),
                len,
                local_ptr: (self.local_ptr as usize + offset) as *mut libc::c_void,
            })
            .collect()
    }
}

impl MemoryOp for ReadOp {
    fn remote_base(&self) -> usize {
        self.remote_base
    }
}
