//! Processes as addressable targets.

use crate::{
    buffer::{MemoryBuffer, Scalar, ScalarAccess},
    module::{Module, ModuleRef},
    target::{
        self, loaded_images, word, AttachOptions, LoadedImage, LocalMemory, MemoryMap, ReadMemory,
        TraceState, Tracee, WriteMemory,
    },
    MemError, MemResult,
};
use nix::{
    sys::wait::WaitStatus,
    unistd::{getpid, Pid},
};
use std::collections::HashMap;

/// Memory that can be read and written at an offset.
///
/// Offsets are absolute addresses for a [`Process`] and module-relative for a
/// [`ModuleRef`].
pub trait DataSource {
    /// What `write` hands back for chaining.
    type Owner;

    /// Reads exactly `size` bytes at `offset`. Fails instead of returning fewer bytes.
    fn read(&self, offset: usize, size: usize) -> MemResult<MemoryBuffer>;

    /// Writes all of `data` at `offset`.
    fn write(&self, offset: usize, data: &[u8]) -> MemResult<&Self::Owner>;

    /// Returns whether `size` bytes at `offset` can be read. Never fails.
    fn can_read(&self, offset: usize, size: usize) -> bool;
}

/// The channel a [`Process`] uses to move bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// One word per ptrace request. Needs a stopped tracee.
    Word,
    /// `process_vm_readv`/`process_vm_writev`, with a ptrace fallback while the tracee is stopped.
    Vectorized,
    /// Plain loads and stores. Only valid for the calling process.
    Local(LocalMemory),
}

/// A process whose memory can be read and written.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    backend: Backend,
    modules: HashMap<String, Module>,
    tracee: Option<Tracee>,
}

impl Process {
    /// Opens the process with id `pid` using the vectorized backend.
    ///
    /// No word-channel backend is chosen here. The vectorized backend falls back to ptrace per
    /// operation, and only while the process is traced by this thread and stopped. Use
    /// [`Process::open_best`] to switch to [`Backend::Word`] up front when the kernel refuses
    /// vectorized access.
    pub fn open(pid: i32) -> MemResult<Process> {
        Process::with_backend(pid, Backend::Vectorized)
    }

    /// Opens the process with id `pid` with the fastest backend the kernel allows.
    ///
    /// A one-byte vectorized read from the first readable mapping decides: if it is denied, the
    /// process gets [`Backend::Word`] and must be traced and stopped before it can be accessed.
    /// The calling process always gets [`Backend::Vectorized`]; see [`Process::local`].
    pub fn open_best(pid: i32) -> MemResult<Process> {
        let mut process = Process::open(pid)?;
        if process.pid == getpid() {
            return Ok(process);
        }

        let first_read = match process.memory_maps()?.iter().find(|map| map.is_readable) {
            Some(map) => {
                let mut byte = [0u8; 1];
                ReadMemory::new(process.pid)
                    .read_slice(&mut byte, map.address.0 as usize)
                    .apply()
            }
            None => Ok(()),
        };
        process.backend = backend_after(first_read);
        tracing::debug!("opened pid {} with {:?} backend", process.pid, process.backend);
        Ok(process)
    }

    /// The calling process, accessed through the vectorized backend.
    ///
    /// Writes are refused; use [`Process::local`] to modify the caller's own memory.
    pub fn me() -> Process {
        Process::new(getpid(), Backend::Vectorized)
    }

    /// The calling process, accessed with direct loads and stores.
    ///
    /// # Safety
    ///
    /// See [`LocalMemory::new`].
    pub unsafe fn local() -> Process {
        Process::new(getpid(), Backend::Local(LocalMemory::new()))
    }

    /// Opens the process with id `pid` using a specific backend.
    pub fn with_backend(pid: i32, backend: Backend) -> MemResult<Process> {
        let pid = Pid::from_raw(pid);
        check_backend(pid, backend)?;
        // Fails early for processes that don't exist.
        procfs::process::Process::new(pid.as_raw())?;
        Ok(Process::new(pid, backend))
    }

    /// Wraps an existing trace attachment.
    pub fn from_tracee(tracee: Tracee) -> Process {
        let mut process = Process::new(tracee.pid(), Backend::Vectorized);
        process.tracee = Some(tracee);
        process
    }

    fn new(pid: Pid, backend: Backend) -> Process {
        Process {
            pid,
            backend,
            modules: HashMap::new(),
            tracee: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn set_backend(&mut self, backend: Backend) -> MemResult<()> {
        check_backend(self.pid, backend)?;
        self.backend = backend;
        Ok(())
    }

    /// Attaches to the process and waits until it stops.
    pub fn attach(&mut self, opts: AttachOptions) -> MemResult<WaitStatus> {
        if self.tracee.is_some() {
            return Err(MemError::precondition(format!(
                "pid {} is already attached",
                self.pid
            )));
        }
        let (tracee, status) = Tracee::attach(self.pid, opts)?;
        self.tracee = Some(tracee);
        Ok(status)
    }

    /// Detaches from the process if attached.
    pub fn detach(&mut self) -> MemResult<()> {
        match self.tracee.as_mut() {
            Some(tracee) => {
                tracee.detach()?;
                self.tracee = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn tracee(&self) -> Option<&Tracee> {
        self.tracee.as_ref()
    }

    pub fn tracee_mut(&mut self) -> Option<&mut Tracee> {
        self.tracee.as_mut()
    }

    fn is_stopped(&self) -> bool {
        self.tracee
            .as_ref()
            .map_or(false, |tracee| tracee.state() == TraceState::Stopped)
    }

    /// Replaces the module map with the images loaded into the calling process.
    ///
    /// Other processes are not supported: register their modules with
    /// [`insert_module`](Process::insert_module), e.g. from [`memory_maps`](Process::memory_maps).
    pub fn init_modules(&mut self) -> MemResult<()> {
        if self.pid != getpid() {
            return Err(MemError::Unsupported(
                "module discovery in another process",
            ));
        }
        self.load_images(&loaded_images());
        tracing::debug!("initialized {} modules", self.modules.len());
        Ok(())
    }

    /// Replaces the module map with one module per image.
    pub fn load_images<'i>(&mut self, images: impl IntoIterator<Item = &'i LoadedImage>) {
        self.modules = images
            .into_iter()
            .map(|image| (image.name.clone(), Module::from(image)))
            .collect();
    }

    /// Registers a module, replacing one with the same name.
    pub fn insert_module(&mut self, module: Module) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn module(&self, name: &str) -> Option<ModuleRef<'_>> {
        self.modules
            .get(name)
            .map(|module| ModuleRef::new(self, module))
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleRef<'_>> {
        self.modules
            .values()
            .map(move |module| ModuleRef::new(self, module))
    }

    pub fn memory_maps(&self) -> MemResult<Vec<MemoryMap>> {
        target::memory_maps(self.pid)
    }
}

impl DataSource for Process {
    type Owner = Process;

    fn read(&self, address: usize, size: usize) -> MemResult<MemoryBuffer> {
        check_range(address, size)?;
        match self.backend {
            Backend::Local(local) => Ok(local.read(address, size)),
            Backend::Word => {
                let bytes = match &self.tracee {
                    Some(tracee) => tracee.read(address, size)?,
                    None => word::read(self.pid, address, size)?,
                };
                Ok(bytes.into())
            }
            Backend::Vectorized => {
                let mut buf = MemoryBuffer::new(size);
                ReadMemory::new(self.pid)
                    .with_ptrace_fallback(self.is_stopped())
                    .read_slice(&mut buf, address)
                    .apply()?;
                Ok(buf)
            }
        }
    }

    fn write(&self, address: usize, data: &[u8]) -> MemResult<&Process> {
        check_range(address, data.len())?;
        match self.backend {
            Backend::Local(local) => local.write(address, data),
            _ if self.pid == getpid() => {
                return Err(MemError::Unsupported(
                    "writing the calling process without the local backend",
                ))
            }
            Backend::Word => match &self.tracee {
                Some(tracee) => tracee.write(address, data)?,
                None => word::write(self.pid, address, data)?,
            },
            // The target is another process, so no Rust reference in this one is affected.
            Backend::Vectorized => unsafe {
                WriteMemory::new(self.pid)
                    .with_ptrace_fallback(self.is_stopped())
                    .write(data, address)
                    .apply()?
            },
        }
        Ok(self)
    }

    fn can_read(&self, address: usize, size: usize) -> bool {
        match self.backend {
            Backend::Local(local) => local.can_read(address, size),
            _ => self.read(address, size).is_ok(),
        }
    }
}

/// Only a denied fast path rules the vectorized backend out. Other failures, e.g. a mapping
/// that went away, say nothing about it.
fn backend_after(first_read: MemResult<()>) -> Backend {
    match first_read {
        Err(err) if err.is_denied() => Backend::Word,
        _ => Backend::Vectorized,
    }
}

fn check_backend(pid: Pid, backend: Backend) -> MemResult<()> {
    match backend {
        Backend::Local(_) if pid != getpid() => Err(MemError::Unsupported(
            "direct access to another process's memory",
        )),
        _ => Ok(()),
    }
}

fn check_range(address: usize, len: usize) -> MemResult<()> {
    match address.checked_add(len) {
        Some(_) => Ok(()),
        None => Err(MemError::AddressOverflow {
            base: address,
            offset: len,
        }),
    }
}

impl ScalarAccess for Process {
    fn read_bytes(&self, address: usize, len: usize) -> MemResult<MemoryBuffer> {
        self.read(address, len)
    }

    fn read_scalar<T: Scalar>(&self, address: usize) -> MemResult<T> {
        match self.backend {
            Backend::Local(local) => local.read_scalar(address),
            _ => Ok(T::from_ne_slice(&self.read(address, T::SIZE)?)),
        }
    }

    fn write_scalar<T: Scalar>(&self, address: usize, value: T) -> MemResult<&Self> {
        match self.backend {
            Backend::Local(local) => {
                local.write_scalar(address, value)?;
                Ok(self)
            }
            _ => {
                let mut bytes = vec![0; T::SIZE];
                value.write_ne_slice(&mut bytes);
                self.write(address, &bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{backend_after, Backend, DataSource, Process};
    use crate::{buffer::ScalarAccess, target::LocalMemory, ErrorKind, MemError};
    use nix::{errno::Errno, unistd::getpid};
    use std::cell::UnsafeCell;

    #[test]
    fn boolean_is_true_above_one() {
        let cell = UnsafeCell::new([0u8, 1, 2, 255]);
        let base = cell.get() as usize;

        for process in [Process::me(), unsafe { Process::local() }].iter() {
            let values: Vec<bool> = (0..4)
                .map(|i| process.read_boolean(base + i).unwrap())
                .collect();
            assert_eq!(values, vec![false, false, true, true]);
        }
    }

    #[test]
    fn local_round_trip() {
        let cell = UnsafeCell::new([0u8; 32]);
        let base = cell.get() as usize;
        let process = unsafe { Process::local() };

        process
            .write(base, &[0xde, 0xad, 0xbe, 0xef])
            .unwrap()
            .write_i16(base + 4, -2)
            .unwrap()
            .write_f32(base + 8, 1.5)
            .unwrap();

        assert_eq!(&process.read(base, 4).unwrap()[..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(process.read_i16(base + 4).unwrap(), -2);
        assert_eq!(process.read_f32(base + 8).unwrap(), 1.5);

        // Reading through the kernel sees the same bytes.
        assert_eq!(Process::me().read_i16(base + 4).unwrap(), -2);
    }

    #[test]
    fn vectorized_refuses_own_writes() {
        let process = Process::me();
        let mut target = [0u8; 4];
        let err = process
            .write(target.as_mut_ptr() as usize, &[1, 2, 3, 4])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(target, [0; 4]);
    }

    #[test]
    fn can_read_never_fails() {
        let data = [7u8; 16];
        let process = Process::me();

        assert!(process.can_read(data.as_ptr() as usize, data.len()));
        assert!(!process.can_read(0, 8));
        assert!(!process.can_read(usize::MAX - 3, 8));
        assert!(process.read(0, 8).is_err());
    }

    #[test]
    fn local_backend_is_limited_to_own_pid() {
        let local = unsafe { LocalMemory::new() };
        assert!(Process::with_backend(getpid().as_raw(), Backend::Local(local)).is_ok());

        let err = Process::with_backend(1, Backend::Local(local)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn discovers_own_modules() {
        let mut process = Process::me();
        process.init_modules().expect("Failed to discover modules");
        assert!(process.modules().count() > 0);

        // The main executable is reported with an empty name.
        assert!(process.module("").is_some());

        let mut other = Process::open(1).expect("init is always running");
        assert_eq!(
            other.init_modules().unwrap_err().kind(),
            ErrorKind::Precondition
        );
    }

    #[test]
    fn denied_fast_path_selects_word_backend() {
        let pid = getpid();

        let denied = MemError::Denied {
            pid,
            source: Errno::ENOSYS,
        };
        assert_eq!(backend_after(Err(denied)), Backend::Word);

        let fault = MemError::Fault {
            pid,
            addr: 0x1000,
            len: 1,
            source: Errno::EFAULT,
        };
        assert_eq!(backend_after(Err(fault)), Backend::Vectorized);
        assert_eq!(backend_after(Ok(())), Backend::Vectorized);

        let me = Process::open_best(pid.as_raw()).unwrap();
        assert_eq!(me.backend(), Backend::Vectorized);
    }
}
