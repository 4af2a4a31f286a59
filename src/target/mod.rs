#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;

mod registers;
pub use registers::*;

/// A mapping of the target's virtual address space, as reported by the kernel.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    /// Start and end range of the mapped memory.
    pub address: (u64, u64),
    /// The file and file offset backing the mapped memory if any.
    pub backing_file: Option<(std::path::PathBuf, u64)>,

    pub is_private: bool,
    pub is_readable: bool,
    pub is_writable: bool,
    pub is_executable: bool,
}

impl MemoryMap {
    /// Checks whether `address` falls inside of this mapping.
    pub fn contains(&self, address: usize) -> bool {
        self.address.0 as usize <= address && address < self.address.1 as usize
    }
}
