//! Direct loads and stores in the calling process's own address space.

use super::vm::{self, Direction};
use crate::{
    buffer::{MemoryBuffer, Scalar, ScalarAccess},
    MemResult,
};
use nix::unistd::getpid;
use std::ptr;

/// Scratch size for [`LocalMemory::can_read`]; larger ranges are checked in pieces.
const SCRATCH_CHUNK: usize = 4096;

/// Memory of the calling process, accessed with plain loads and stores.
///
/// Nothing is validated: an unmapped address faults the whole process. Use
/// [`can_read`](LocalMemory::can_read) to check a range first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalMemory {
    _private: (),
}

impl LocalMemory {
    /// # Safety
    ///
    /// Every access made through the returned handle must target memory that is mapped and
    /// not aliased by live Rust references for the duration of the access.
    pub unsafe fn new() -> Self {
        LocalMemory { _private: () }
    }

    /// Copies `len` bytes starting at `address` into a new buffer.
    pub fn read(&self, address: usize, len: usize) -> MemoryBuffer {
        let mut buf = MemoryBuffer::new(len);
        unsafe { ptr::copy(address as *const u8, buf.as_mut_ptr(), len) };
        buf
    }

    /// Copies `data` to `address`.
    pub fn write(&self, address: usize, data: &[u8]) {
        unsafe { ptr::copy(data.as_ptr(), address as *mut u8, data.len()) };
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    pub fn copy(&self, src: usize, dst: usize, len: usize) {
        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) };
    }

    pub fn load<T: Scalar>(&self, address: usize) -> T {
        unsafe { ptr::read_unaligned(address as *const T) }
    }

    pub fn store<T: Scalar>(&self, address: usize, value: T) {
        unsafe { ptr::write_unaligned(address as *mut T, value) }
    }

    /// Checks whether `len` bytes at `address` can be read without faulting.
    ///
    /// A faulting load cannot be recovered from, so the range is copied by the kernel instead.
    pub fn can_read(&self, address: usize, len: usize) -> bool {
        if address.checked_add(len).is_none() {
            return false;
        }

        let pid = getpid();
        let mut scratch = [0u8; SCRATCH_CHUNK];
        let mut done = 0;
        while done < len {
            let chunk = std::cmp::min(len - done, SCRATCH_CHUNK);
            let local = [libc::iovec {
                iov_base: scratch.as_mut_ptr() as *mut libc::c_void,
                iov_len: chunk,
            }];
            let remote = [libc::iovec {
                iov_base: (address + done) as *mut libc::c_void,
                iov_len: chunk,
            }];
            match unsafe { vm::transfer(pid, Direction::Read, &local, &remote) } {
                Ok(n) if n == chunk => done += chunk,
                _ => return false,
            }
        }
        true
    }
}

impl ScalarAccess for LocalMemory {
    fn read_bytes(&self, address: usize, len: usize) -> MemResult<MemoryBuffer> {
        Ok(self.read(address, len))
    }

    fn read_scalar<T: Scalar>(&self, address: usize) -> MemResult<T> {
        Ok(self.load(address))
    }

    fn write_scalar<T: Scalar>(&self, address: usize, value: T) -> MemResult<&Self> {
        self.store(address, value);
        Ok(self)
    }
}
