//! Utility functions to work with memory.

use crate::{target::MemoryMap, MemError, MemResult};
use nix::unistd::Pid;
use std::cmp::Ordering;

lazy_static::lazy_static! {
    /// Memory page size from system configuration.
    pub static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };

    /// Largest number of spans accepted by one scatter/gather call.
    pub(crate) static ref IOV_MAX: usize = {
        let max = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
        if max > 0 { max as usize } else { 1024 }
    };
}

/// Abstract memory operation (reading or writing).
pub trait MemoryOp {
    /// Returns a remote address at which this memory operation will be applied to.
    fn remote_base(&self) -> usize;
}

impl<T: MemoryOp> MemoryOp for &T {
    fn remote_base(&self) -> usize {
        (*self).remote_base()
    }
}

/// Splits memory operations to those that touch protected memory and those that do not.
/// `maps` must be sorted by address and pre-filtered to contain only protected pages, e.g.:
/// ```
/// use memcrab::target::MemoryMap;
///
/// let maps: Vec<MemoryMap> = vec![];
/// let protected_maps = maps.into_iter().filter(|map| !map.is_writable);
/// ```
pub fn split_protected<M: MemoryOp>(
    maps: &[MemoryMap],
    operations: impl Iterator<Item = M>,
) -> (Vec<M>, Vec<M>) {
    operations.partition(|op| {
        maps.binary_search_by(|map| {
            if op.remote_base() < map.address.0 as usize {
                Ordering::Greater
            } else if op.remote_base() >= map.address.1 as usize {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        })
        .is_ok()
    })
}

/// How a batch continues after its first scatter/gather pass.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum NextStep {
    /// Every byte was transferred.
    Done,
    /// The fast path is unavailable; the whole batch goes through ptrace.
    Ptrace,
    /// The pass stopped after `done` bytes; split the batch by page protection and retry.
    Split { done: usize },
}

/// Decides how to continue a batch of `expected` bytes at `addr` given the result of the first
/// pass. Without ptrace fallback anything short of a full transfer is an error.
pub(crate) fn next_step(
    pid: Pid,
    addr: usize,
    expected: usize,
    first_pass: MemResult<usize>,
    ptrace_fallback: bool,
) -> MemResult<NextStep> {
    let done = match first_pass {
        Ok(done) if done == expected => return Ok(NextStep::Done),
        Ok(done) => done,
        Err(err) if err.is_denied() && ptrace_fallback => {
            tracing::warn!("{}, falling back to ptrace for pid {}", err, pid);
            return Ok(NextStep::Ptrace);
        }
        Err(MemError::Fault { .. }) => 0,
        Err(err) => return Err(err),
    };

    if ptrace_fallback {
        Ok(NextStep::Split { done })
    } else {
        Err(MemError::Partial {
            pid,
            addr,
            expected,
            done,
        })
    }
}

/// Splits `[base, base + len)` into pieces that each reside in only one memory page.
/// Yields `(offset, len)` pairs relative to `base`.
pub(crate) fn page_chunks(base: usize, len: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut done = 0;

    while done < len {
        let addr = base.wrapping_add(done);
        let next_page_distance = *PAGE_SIZE - ((*PAGE_SIZE - 1) & addr);
        let chunk = std::cmp::min(len - done, next_page_distance);
        out.push((done, chunk));
        done += chunk;
    }
    out
}
