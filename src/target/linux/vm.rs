//! Scatter/gather copies between address spaces with `process_vm_readv(2)`/`process_vm_writev(2)`.
//!
//! This is the fast cross-process path: one system call moves many spans. It needs the same
//! permissions as `PTRACE_MODE_ATTACH_REALCREDS`; when those are missing the call fails with
//! [`MemError::Denied`] and callers may fall back to the word channel.

use super::memory::IOV_MAX;
use crate::{MemError, MemResult};
use nix::{errno::Errno, unistd::Pid};
use std::{cmp::min, convert::TryFrom};

/// An `(address, length)` descriptor of one contiguous span of memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpan {
    pub base: usize,
    pub len: i32,
}

impl MemorySpan {
    pub fn new(base: usize, len: i32) -> Self {
        MemorySpan { base, len }
    }

    /// Describes a local slice.
    pub fn from_slice(slice: &[u8]) -> MemResult<Self> {
        let len = i32::try_from(slice.len()).map_err(|_| {
            MemError::precondition(format!("span of {} bytes is too long", slice.len()))
        })?;
        Ok(MemorySpan::new(slice.as_ptr() as usize, len))
    }

    fn as_iovec(&self) -> libc::iovec {
        libc::iovec {
            iov_base: self.base as *mut libc::c_void,
            iov_len: self.len as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Remote to local.
    Read,
    /// Local to remote.
    Write,
}

/// Validates a pair of span lists before anything is handed to the kernel.
pub fn check_spans(source: &[MemorySpan], destination: &[MemorySpan]) -> MemResult<()> {
    if destination.len() > source.len() {
        return Err(MemError::precondition(format!(
            "{} destination spans exceed {} source spans",
            destination.len(),
            source.len()
        )));
    }
    if let Some(span) = source.iter().chain(destination).find(|span| span.len < 0) {
        return Err(MemError::precondition(format!(
            "negative span length {} at {:#x}",
            span.len, span.base
        )));
    }
    Ok(())
}

/// Copies spans of `pid`'s memory described by `remote` into local spans.
///
/// Returns the number of bytes transferred; a short count means a remote span was not readable.
///
/// # Safety
///
/// Every `local` span must describe memory of the calling process that is valid for writes.
pub unsafe fn read_spans(
    pid: Pid,
    local: &[MemorySpan],
    remote: &[MemorySpan],
) -> MemResult<usize> {
    check_spans(remote, local)?;
    transfer_spans(pid, Direction::Read, local, remote)
}

/// Copies local spans into spans of `pid`'s memory described by `remote`.
///
/// # Safety
///
/// Every `local` span must describe memory of the calling process that is valid for reads.
pub unsafe fn write_spans(
    pid: Pid,
    local: &[MemorySpan],
    remote: &[MemorySpan],
) -> MemResult<usize> {
    check_spans(local, remote)?;
    transfer_spans(pid, Direction::Write, local, remote)
}

unsafe fn transfer_spans(
    pid: Pid,
    direction: Direction,
    local: &[MemorySpan],
    remote: &[MemorySpan],
) -> MemResult<usize> {
    let local_iov = local.iter().map(MemorySpan::as_iovec).collect::<Vec<_>>();
    let remote_iov = remote.iter().map(MemorySpan::as_iovec).collect::<Vec<_>>();

    let mut total = 0;
    let mut start = 0;
    while start < local_iov.len() && start < remote_iov.len() {
        let local_window = &local_iov[start..min(start + *IOV_MAX, local_iov.len())];
        let remote_window = &remote_iov[start..min(start + *IOV_MAX, remote_iov.len())];

        let expected = min(iov_len(local_window), iov_len(remote_window));
        let done = transfer(pid, direction, local_window, remote_window)?;
        total += done;
        if done < expected {
            break;
        }
        start += *IOV_MAX;
    }
    Ok(total)
}

fn iov_len(iov: &[libc::iovec]) -> usize {
    iov.iter().map(|iov| iov.iov_len).sum()
}

/// Issues a single `process_vm_readv`/`process_vm_writev` call.
///
/// # Safety
///
/// `local` must describe memory of the calling process valid for the given direction.
pub(crate) unsafe fn transfer(
    pid: Pid,
    direction: Direction,
    local: &[libc::iovec],
    remote: &[libc::iovec],
) -> MemResult<usize> {
    if local.is_empty() || remote.is_empty() {
        return Ok(0);
    }

    tracing::trace!(
        "process_vm {:?} pid={} local={} remote={}",
        direction,
        pid,
        local.len(),
        remote.len()
    );

    let result = match direction {
        Direction::Read => libc::process_vm_readv(
            pid.into(),
            local.as_ptr(),
            local.len() as libc::c_ulong,
            remote.as_ptr(),
            remote.len() as libc::c_ulong,
            0,
        ),
        Direction::Write => libc::process_vm_writev(
            pid.into(),
            local.as_ptr(),
            local.len() as libc::c_ulong,
            remote.as_ptr(),
            remote.len() as libc::c_ulong,
            0,
        ),
    };

    if result == -1 {
        let addr = remote[0].iov_base as usize;
        return Err(classify(pid, addr, iov_len(remote), Errno::last()));
    }
    Ok(result as usize)
}

/// Maps an errno of the vectored calls onto the error taxonomy.
pub(crate) fn classify(pid: Pid, addr: usize, len: usize, errno: Errno) -> MemError {
    match errno {
        Errno::EPERM | Errno::EACCES | Errno::ENOSYS => MemError::Denied { pid, source: errno },
        source => MemError::Fault {
            pid,
            addr,
            len,
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{check_spans, classify, read_spans, write_spans, MemorySpan};
    use crate::ErrorKind;
    use nix::{errno::Errno, unistd::getpid};
    use std::mem::{offset_of, size_of};

    #[test]
    fn span_layout() {
        assert_eq!(size_of::<MemorySpan>(), 16);
        assert_eq!(offset_of!(MemorySpan, base), 0);
        assert_eq!(offset_of!(MemorySpan, len), 8);
    }

    #[test]
    fn rejects_more_destinations_than_sources() {
        let source = [MemorySpan::new(0x1000, 8)];
        let destination = [MemorySpan::new(0x2000, 4), MemorySpan::new(0x3000, 4)];

        let err = check_spans(&source, &destination).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);

        // Nothing is dereferenced: the spans point at unmapped memory.
        let err = unsafe { read_spans(getpid(), &destination, &source) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn rejects_negative_lengths() {
        let source = [MemorySpan::new(0x1000, 8), MemorySpan::new(0x1008, -1)];
        let destination = [MemorySpan::new(0x2000, 8)];

        assert!(check_spans(&source, &destination).is_err());
        let err = unsafe { write_spans(getpid(), &source, &destination) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn copies_spans_within_own_process() {
        let src: [u8; 6] = [1, 2, 3, 4, 5, 6];
        let mut dst_a = [0u8; 4];
        let mut dst_b = [0u8; 2];

        let remote = [MemorySpan::from_slice(&src).unwrap()];
        let local = [
            MemorySpan::new(dst_a.as_mut_ptr() as usize, 4),
            MemorySpan::new(dst_b.as_mut_ptr() as usize, 2),
        ];

        let read = unsafe { read_spans(getpid(), &local, &remote) };
        // One remote span feeds two local spans, which the count check forbids.
        assert!(read.is_err());

        let remote = [
            MemorySpan::new(src.as_ptr() as usize, 4),
            MemorySpan::new(src.as_ptr() as usize + 4, 2),
        ];
        let read = unsafe { read_spans(getpid(), &local, &remote) }.unwrap();
        assert_eq!(read, 6);
        assert_eq!(dst_a, [1, 2, 3, 4]);
        assert_eq!(dst_b, [5, 6]);

        dst_a = [9, 9, 9, 9];
        let written = unsafe {
            write_spans(
                getpid(),
                &[MemorySpan::from_slice(&dst_a).unwrap()],
                &[MemorySpan::new(dst_b.as_mut_ptr() as usize, 2)],
            )
        }
        .unwrap();
        assert_eq!(written, 2);
        assert_eq!(dst_b, [9, 9]);
    }

    #[test]
    fn classifies_permission_errors() {
        let pid = getpid();
        assert!(classify(pid, 0, 8, Errno::EPERM).is_denied());
        assert!(classify(pid, 0, 8, Errno::ENOSYS).is_denied());
        assert_eq!(classify(pid, 0, 8, Errno::EFAULT).kind(), ErrorKind::Access);
    }
}
