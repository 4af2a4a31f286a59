//! Named regions of a process's address space.

use crate::{
    buffer::MemoryBuffer,
    process::{DataSource, Process},
    target::LoadedImage,
    MemError, MemResult,
};
use std::{cell::RefCell, rc::Rc};

/// A named, sized region of a process's address space, such as a loaded library image.
///
/// A module only describes the region. Access goes through [`ModuleRef`], which pairs it with
/// the owning [`Process`].
#[derive(Debug)]
pub struct Module {
    name: String,
    base: usize,
    size: usize,
    snapshot: RefCell<Option<Rc<MemoryBuffer>>>,
}

impl Module {
    pub fn new(name: impl Into<String>, base: usize, size: usize) -> Self {
        Module {
            name: name.into(),
            base,
            size,
            snapshot: RefCell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl From<&LoadedImage> for Module {
    fn from(image: &LoadedImage) -> Self {
        let (base, size) = image.region();
        Module::new(image.name.clone(), base, size)
    }
}

/// A module of a particular process.
#[derive(Debug, Clone, Copy)]
pub struct ModuleRef<'a> {
    process: &'a Process,
    module: &'a Module,
}

impl<'a> ModuleRef<'a> {
    pub(crate) fn new(process: &'a Process, module: &'a Module) -> Self {
        ModuleRef { process, module }
    }

    pub fn process(&self) -> &'a Process {
        self.process
    }

    pub fn name(&self) -> &'a str {
        self.module.name()
    }

    pub fn base(&self) -> usize {
        self.module.base
    }

    pub fn size(&self) -> usize {
        self.module.size
    }

    /// Translates a module-relative offset into an absolute address.
    ///
    /// Offsets past the end of the module are translated as well. Whether they can be accessed
    /// depends on the memory map of the process.
    pub fn address(&self, offset: usize) -> MemResult<usize> {
        self.module
            .base
            .checked_add(offset)
            .ok_or(MemError::AddressOverflow {
                base: self.module.base,
                offset,
            })
    }

    /// Returns a snapshot of the whole module, reading it on first use.
    pub fn data(&self) -> MemResult<Rc<MemoryBuffer>> {
        if let Some(snapshot) = self.module.snapshot.borrow().as_ref() {
            return Ok(Rc::clone(snapshot));
        }
        self.refresh()
    }

    /// Reads the module again and replaces the cached snapshot.
    pub fn refresh(&self) -> MemResult<Rc<MemoryBuffer>> {
        let snapshot = Rc::new(self.process.read(self.module.base, self.module.size)?);
        *self.module.snapshot.borrow_mut() = Some(Rc::clone(&snapshot));
        Ok(snapshot)
    }
}

impl<'a> DataSource for ModuleRef<'a> {
    type Owner = Process;

    fn read(&self, offset: usize, size: usize) -> MemResult<MemoryBuffer> {
        self.process.read(self.address(offset)?, size)
    }

    fn write(&self, offset: usize, data: &[u8]) -> MemResult<&Process> {
        self.process.write(self.address(offset)?, data)
    }

    fn can_read(&self, offset: usize, size: usize) -> bool {
        match self.address(offset) {
            Ok(address) => self.process.can_read(address, size),
            Err(_) => false,
        }
    }
}
