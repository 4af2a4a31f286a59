//! Accesses a child's memory through `Process` with each cross-process backend.


use memcrab::{
    buffer::ScalarAccess,
    module::Module,
    process::{Backend, DataSource, Process},
    target::PAGE_SIZE,
    ErrorKind,
};

/// Maps `pages` anonymous pages filled with `fill`.
fn map_pages(pages: usize, fill: u8) -> usize {
    let len = pages * *PAGE_SIZE;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    assert_ne!(ptr, libc::MAP_FAILED);
    unsafe { std::ptr::write_bytes(ptr as *mut u8, fill, len) };
    ptr as usize
}

fn protect(addr: usize, prot: libc::c_int) {
    assert_eq!(
        unsafe { libc::mprotect(addr as *mut libc::c_void, *PAGE_SIZE, prot) },
        0
    );
}

#[test]
fn scalars_in_another_process() {
    let values = [0u8, 1, 2, 255];
    let number: i32 = -123_456;
    let text = *b"Hello, world!\0\0\0";

    let tracee = test_utils::spawn_traced();
    let mut process = Process::from_tracee(tracee);

    let bools: Vec<bool> = (0..values.len())
        .map(|i| process.read_boolean(values.as_ptr() as usize + i).unwrap())
        .collect();
    assert_eq!(bools, vec![false, false, true, true]);

    assert_eq!(process.read_i32(&number as *const i32 as usize).unwrap(), number);
    assert_eq!(
        process.read_string(text.as_ptr() as usize, text.len()).unwrap(),
        "Hello, world!"
    );

    process.write_i32(&number as *const i32 as usize, 42).unwrap();
    assert_eq!(process.read_i32(&number as *const i32 as usize).unwrap(), 42);
    assert_eq!(number, -123_456);

    process.tracee_mut().unwrap().kill().unwrap();
}

#[test]
fn protected_pages_fall_back_to_ptrace() {
    let page = *PAGE_SIZE;
    let base = map_pages(3, 0xaa);
    unsafe { std::ptr::write_bytes((base + page) as *mut u8, 0xbb, page) };
    protect(base + page, libc::PROT_NONE);
    protect(base + 2 * page, libc::PROT_READ);

    let tracee = test_utils::spawn_traced();
    let mut process = Process::from_tracee(tracee);

    // The read straddles a readable and an unreadable page.
    let read = process.read(base + page - 4, 8).unwrap();
    assert_eq!(&read[..], &[0xaa, 0xaa, 0xaa, 0xaa, 0xbb, 0xbb, 0xbb, 0xbb]);

    // Read-only pages are written through ptrace.
    process.write(base + 2 * page + 3, &[1, 2, 3, 4, 5]).unwrap();
    let read = process.read(base + 2 * page, 10).unwrap();
    assert_eq!(&read[..], &[0xaa, 0xaa, 0xaa, 1, 2, 3, 4, 5, 0xaa, 0xaa]);

    let maps = process.memory_maps().unwrap();
    let map = maps.iter().find(|map| map.contains(base + page)).unwrap();
    assert!(!map.is_readable);

    process.tracee_mut().unwrap().kill().unwrap();
}

#[test]
fn writes_into_read_only_pages_complete() {
    let page = *PAGE_SIZE;
    let base = map_pages(2, 0xaa);
    protect(base + page, libc::PROT_READ);

    let tracee = test_utils::spawn_traced();
    let mut process = Process::from_tracee(tracee);

    // Starts on a writable page and ends on a read-only one.
    let payload: Vec<u8> = (1..=8).collect();
    process.write(base + page - 4, &payload).unwrap();
    assert_eq!(&process.read(base + page - 4, 8).unwrap()[..], &payload[..]);
    assert_eq!(&process.read(base + page - 6, 2).unwrap()[..], &[0xaa; 2]);
    assert_eq!(&process.read(base + page + 4, 2).unwrap()[..], &[0xaa; 2]);

    process.tracee_mut().unwrap().kill().unwrap();
}

#[test]
fn short_word_accesses_at_the_end_of_a_mapping() {
    let page = *PAGE_SIZE;
    let base = map_pages(2, 0x11);
    assert_eq!(
        unsafe { libc::munmap((base + page) as *mut libc::c_void, page) },
        0
    );

    let tracee = test_utils::spawn_traced();
    let mut process = Process::from_tracee(tracee);
    process.set_backend(Backend::Word).unwrap();

    let end = base + page - 3;
    assert_eq!(&process.read(end, 3).unwrap()[..], &[0x11; 3]);

    process.write(end, &[1, 2, 3]).unwrap();
    assert_eq!(&process.read(end, 3).unwrap()[..], &[1, 2, 3]);
    assert_eq!(&process.read(end - 5, 5).unwrap()[..], &[0x11; 5]);

    process.tracee_mut().unwrap().kill().unwrap();
}

#[test]
fn untraced_reads_stop_at_protected_pages() {
    let page = *PAGE_SIZE;
    let base = map_pages(2, 0xcc);
    protect(base + page, libc::PROT_NONE);

    let pid = test_utils::spawn_spinning();
    let process = Process::open(pid.as_raw()).unwrap();

    assert_eq!(&process.read(base, 4).unwrap()[..], &[0xcc; 4]);
    assert!(process.can_read(base, page));
    assert!(!process.can_read(base + page - 4, 8));
    assert!(!process.can_read(0, 1));

    let err = process.read(base + page - 4, 8).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);

    // A child of the caller may be read with the fast path.
    let best = Process::open_best(pid.as_raw()).unwrap();
    assert_eq!(best.backend(), Backend::Vectorized);
    assert_eq!(&best.read(base, 4).unwrap()[..], &[0xcc; 4]);

    test_utils::kill_untraced(pid);
}

#[test]
fn word_backend_round_trip() {
    let data = [0u8; 24];
    let addr = data.as_ptr() as usize;

    let tracee = test_utils::spawn_traced();
    let mut process = Process::from_tracee(tracee);
    process.set_backend(Backend::Word).unwrap();

    let payload: Vec<u8> = (1..=13).collect();
    process.write(addr + 5, &payload).unwrap();
    assert_eq!(&process.read(addr + 5, payload.len()).unwrap()[..], &payload[..]);
    assert_eq!(&process.read(addr, 5).unwrap()[..], &[0; 5]);

    process.tracee_mut().unwrap().kill().unwrap();

    // Without a tracer the word channel has nothing to talk to.
    let pid = test_utils::spawn_spinning();
    let untraced = Process::with_backend(pid.as_raw(), Backend::Word).unwrap();
    assert_eq!(untraced.read(addr, 8).unwrap_err().kind(), ErrorKind::Request);
    assert!(!untraced.can_read(addr, 8));
    test_utils::kill_untraced(pid);
}

#[test]
fn modules_from_memory_maps() {
    let base = map_pages(1, 0x5a);

    let pid = test_utils::spawn_spinning();
    let mut process = Process::open(pid.as_raw()).unwrap();

    assert_eq!(
        process.init_modules().unwrap_err().kind(),
        ErrorKind::Precondition
    );

    let map = process
        .memory_maps()
        .unwrap()
        .into_iter()
        .find(|map| map.contains(base))
        .unwrap();
    let size = (map.address.1 - map.address.0) as usize;
    process.insert_module(Module::new("anon", map.address.0 as usize, size));

    let module = process.module("anon").unwrap();
    let offset = base - module.base();
    assert_eq!(&module.read(offset, 3).unwrap()[..], &[0x5a; 3]);
    assert!(module.can_read(offset, *PAGE_SIZE));
    assert!(!module.can_read(usize::MAX - module.base() + 1, 1));

    test_utils::kill_untraced(pid);
}
