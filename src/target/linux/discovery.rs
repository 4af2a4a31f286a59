//! Enumerates images loaded into the calling process with `dl_iterate_phdr(3)`.

use std::{
    ffi::CStr,
    os::raw::{c_int, c_void},
    slice,
};

/// One program header of a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Segment type, e.g. `libc::PT_LOAD`.
    pub kind: u32,
    pub vaddr: u64,
    pub memsz: u64,
}

/// An image (executable, shared object or vDSO) mapped into the calling process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Name reported by the loader. The main executable is usually reported with an empty name.
    pub name: String,
    /// Difference between the image's virtual addresses and where it is actually loaded.
    pub load_base: u64,
    pub segments: Vec<Segment>,
}

impl LoadedImage {
    /// Returns `(base, size)` of the first loadable segment.
    ///
    /// Images without a loadable segment fall back to their first program header, and images
    /// without program headers to an empty region at the load base.
    pub fn region(&self) -> (usize, usize) {
        let segment = self
            .segments
            .iter()
            .find(|segment| segment.kind == libc::PT_LOAD)
            .or_else(|| self.segments.first());

        match segment {
            Some(segment) => (
                self.load_base.wrapping_add(segment.vaddr) as usize,
                segment.memsz as usize,
            ),
            None => (self.load_base as usize, 0),
        }
    }
}

/// Lists every image the dynamic loader reports, in loader order.
pub fn loaded_images() -> Vec<LoadedImage> {
    let mut images: Vec<LoadedImage> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_image),
            &mut images as *mut Vec<LoadedImage> as *mut c_void,
        );
    }
    tracing::debug!("discovered {} loaded images", images.len());
    images
}

unsafe extern "C" fn collect_image(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let images = &mut *(data as *mut Vec<LoadedImage>);
    let info = &*info;

    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };

    let headers = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
    };

    images.push(LoadedImage {
        name,
        load_base: info.dlpi_addr as u64,
        segments: headers
            .iter()
            .map(|phdr| Segment {
                kind: phdr.p_type,
                vaddr: phdr.p_vaddr as u64,
                memsz: phdr.p_memsz as u64,
            })
            .collect(),
    });

    // Keep iterating.
    0
}

#[cfg(test)]
mod tests {
    use super::{loaded_images, LoadedImage, Segment};

    fn segment(kind: u32, vaddr: u64, memsz: u64) -> Segment {
        Segment { kind, vaddr, memsz }
    }

    #[test]
    fn region_uses_first_loadable_segment() {
        let image = LoadedImage {
            name: "libfoo.so".to_string(),
            load_base: 0x7f00_0000_0000,
            segments: vec![
                segment(libc::PT_PHDR, 0x40, 0x2d8),
                segment(libc::PT_LOAD, 0x1000, 0x3000),
                segment(libc::PT_LOAD, 0x5000, 0x800),
            ],
        };
        assert_eq!(image.region(), (0x7f00_0000_1000, 0x3000));
    }

    #[test]
    fn region_falls_back_to_first_header() {
        let image = LoadedImage {
            name: String::new(),
            load_base: 0x1000,
            segments: vec![segment(libc::PT_NOTE, 0x200, 0x24)],
        };
        assert_eq!(image.region(), (0x1200, 0x24));

        let bare = LoadedImage {
            segments: Vec::new(),
            ..image
        };
        assert_eq!(bare.region(), (0x1000, 0));
    }

    #[test]
    fn finds_own_images() {
        let images = loaded_images();
        assert!(!images.is_empty());

        // Some image has a loadable segment containing this function.
        let here = finds_own_images as usize;
        assert!(images.iter().any(|image| {
            image.segments.iter().any(|s| {
                let start = image.load_base.wrapping_add(s.vaddr) as usize;
                s.kind == libc::PT_LOAD && start <= here && here < start + s.memsz as usize
            })
        }));
    }
}
