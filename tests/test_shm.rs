// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named shared memory tests: open modes, reference counting, size
// discovery, data visibility across handles.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossipc::{ShmHandle, ShmOpenMode};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_shm_{n}")
}

#[test]
fn acquire_create() {
    let name = unique_name("acquire_create");
    ShmHandle::unlink_by_name(&name);

    let shm = ShmHandle::acquire(&name, 1024, ShmOpenMode::Create).expect("acquire create");
    assert!(shm.mapped_size() >= 1024);
    assert_ne!(shm.as_ptr() as usize, 0);
    assert!(shm.is_creator());
}

#[test]
fn acquire_open_nonexistent_fails() {
    let name = unique_name("acquire_open_fail");
    ShmHandle::unlink_by_name(&name);

    let result = ShmHandle::acquire(&name, 1024, ShmOpenMode::Open);
    assert!(result.is_err());
}

#[test]
fn acquire_create_or_open() {
    let name = unique_name("acquire_both");
    ShmHandle::unlink_by_name(&name);

    let shm = ShmHandle::acquire(&name, 2048, ShmOpenMode::CreateOrOpen)
        .expect("acquire create_or_open");
    assert!(shm.mapped_size() >= 2048);
    assert_ne!(shm.as_ptr() as usize, 0);
}

#[test]
fn write_and_read_back() {
    let name = unique_name("get_mem");
    ShmHandle::unlink_by_name(&name);

    let shm = ShmHandle::acquire(&name, 512, ShmOpenMode::Create).expect("acquire");

    let test_data = b"Shared memory test data";
    unsafe {
        std::ptr::copy_nonoverlapping(test_data.as_ptr(), shm.as_mut_ptr(), test_data.len());
    }
    let read_back = unsafe { std::slice::from_raw_parts(shm.as_ptr(), test_data.len()) };
    assert_eq!(read_back, test_data);
}

#[test]
fn reference_count_tracks_handles() {
    let name = unique_name("ref_count");
    ShmHandle::unlink_by_name(&name);

    let shm1 = ShmHandle::acquire(&name, 512, ShmOpenMode::CreateOrOpen).expect("acquire 1");
    assert_eq!(shm1.ref_count(), 1);
    assert!(shm1.is_creator());

    let shm2 = ShmHandle::acquire(&name, 512, ShmOpenMode::CreateOrOpen).expect("acquire 2");
    assert_eq!(shm1.ref_count(), 2);
    assert_eq!(shm2.ref_count(), 2);
    assert!(!shm2.is_creator());

    drop(shm2);
    assert_eq!(shm1.ref_count(), 1);

    drop(shm1);
}

#[test]
fn open_discovers_size_when_zero() {
    let name = unique_name("discover");
    ShmHandle::unlink_by_name(&name);

    let creator = ShmHandle::acquire(&name, 4096, ShmOpenMode::Create).expect("create");

    let joiner = ShmHandle::acquire(&name, 0, ShmOpenMode::Open).expect("open blind");
    assert!(joiner.user_size() >= 4096);
    assert_eq!(joiner.mapped_size(), creator.mapped_size());
}

#[test]
fn multiple_handles_share_data() {
    let name = unique_name("multiple_handles");
    ShmHandle::unlink_by_name(&name);

    let h1 = ShmHandle::acquire(&name, 512, ShmOpenMode::CreateOrOpen).expect("acquire 1");
    let h2 = ShmHandle::acquire(&name, 512, ShmOpenMode::CreateOrOpen).expect("acquire 2");

    unsafe {
        let ptr1 = h1.as_mut_ptr() as *mut i32;
        *ptr1 = 12345;

        let ptr2 = h2.as_ptr() as *const i32;
        assert_eq!(*ptr2, 12345);
    }
}

#[test]
fn struct_round_trip_between_handles() {
    let name = unique_name("write_read");
    ShmHandle::unlink_by_name(&name);

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct TestData {
        value: i32,
        text: [u8; 64],
    }

    let shm1 = ShmHandle::acquire(&name, 1024, ShmOpenMode::CreateOrOpen).expect("acquire 1");

    let data = TestData {
        value: 42,
        text: {
            let mut buf = [0u8; 64];
            let msg = b"Shared memory data";
            buf[..msg.len()].copy_from_slice(msg);
            buf
        },
    };

    unsafe {
        let ptr = shm1.as_mut_ptr() as *mut TestData;
        std::ptr::write(ptr, data);
    }

    let shm2 = ShmHandle::acquire(&name, 1024, ShmOpenMode::CreateOrOpen).expect("acquire 2");
    let read_data = unsafe { &*(shm2.as_ptr() as *const TestData) };
    assert_eq!(read_data.value, 42);
    assert_eq!(&read_data.text[..18], b"Shared memory data");
}

#[test]
fn last_handle_unlinks_segment() {
    let name = unique_name("last_unlink");
    ShmHandle::unlink_by_name(&name);

    {
        let _shm = ShmHandle::acquire(&name, 256, ShmOpenMode::CreateOrOpen).expect("acquire");
    }
    // The only handle dropped, so the segment is gone.
    let result = ShmHandle::acquire(&name, 256, ShmOpenMode::Open);
    assert!(result.is_err());
}

#[test]
fn empty_name_fails() {
    let result = ShmHandle::acquire("", 256, ShmOpenMode::CreateOrOpen);
    assert!(result.is_err());
}

#[test]
fn zero_size_create_fails() {
    let result = ShmHandle::acquire(&unique_name("zero_size"), 0, ShmOpenMode::CreateOrOpen);
    assert!(result.is_err());
}

#[test]
fn create_exclusive_fails_if_exists() {
    let name = unique_name("create_excl");
    ShmHandle::unlink_by_name(&name);

    let _h1 = ShmHandle::acquire(&name, 256, ShmOpenMode::Create).expect("first create");
    let result = ShmHandle::acquire(&name, 256, ShmOpenMode::Create);
    assert!(
        result.is_err(),
        "exclusive create should fail when segment already exists"
    );
}

#[test]
fn various_sizes() {
    for &size in &[1usize, 4, 7, 63, 64, 65, 255, 256, 1023, 1024, 4096, 65536] {
        let name = unique_name(&format!("size_{size}"));
        ShmHandle::unlink_by_name(&name);

        let shm = ShmHandle::acquire(&name, size, ShmOpenMode::CreateOrOpen)
            .unwrap_or_else(|e| panic!("failed to acquire shm of size {size}: {e}"));
        assert!(
            shm.mapped_size() >= size,
            "mapped_size {} < requested {size}",
            shm.mapped_size()
        );
    }
}
