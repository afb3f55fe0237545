// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// SharedRegion tests: mapping lifecycle, byte round trips, locked writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossipc::SharedRegion;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_id(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_region_{n}")
}

fn fresh_region(prefix: &str, size: usize) -> SharedRegion {
    let id = unique_id(prefix);
    let mut region = SharedRegion::new(&id, size);
    region.unlink().expect("stale cleanup");
    region.setup().expect("setup");
    region
}

#[test]
fn write_then_read_round_trip() {
    let region = fresh_region("round_trip", 256);
    region.write(b"hello region").expect("write");

    let data = region.read().expect("read");
    assert_eq!(data.len(), 256);
    assert!(data.starts_with(b"hello region"));
}

#[test]
fn write_larger_than_region_fails() {
    let region = fresh_region("too_big", 16);
    let err = region.write(&[0xAB; 17]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn write_before_setup_fails() {
    let region = SharedRegion::new(&unique_id("unmapped"), 64);
    assert!(region.write(b"x").is_err());
    assert!(region.read().is_err());
}

#[test]
fn read_string_truncates_at_nul() {
    let region = fresh_region("read_string", 64);
    region.write(b"short\0garbage after").expect("write");
    assert_eq!(region.read_string().expect("read"), "short");
}

#[test]
fn length_prefixed_round_trip() {
    let region = fresh_region("len_prefix", 64);
    let mut framed = (5u32).to_le_bytes().to_vec();
    framed.extend_from_slice(b"12345");
    region.write(&framed).expect("write");

    let payload = region.read_length_prefixed().expect("read").expect("some");
    assert_eq!(payload, b"12345");
}

#[test]
fn length_prefix_overrun_is_none() {
    let region = fresh_region("len_overrun", 16);
    region.write(&(100u32).to_le_bytes()).expect("write");
    assert!(region.read_length_prefixed().expect("read").is_none());
}

#[test]
fn clear_zeroes_everything() {
    let region = fresh_region("clear", 128);
    region.write(&[0xFF; 128]).expect("write");
    region.clear().expect("clear");
    assert!(region.read().expect("read").iter().all(|&b| b == 0));
}

#[test]
fn two_handles_share_content() {
    let id = unique_id("shared");
    let mut writer = SharedRegion::new(&id, 128);
    writer.unlink().expect("stale cleanup");
    writer.setup().expect("setup writer");

    let mut reader = SharedRegion::new(&id, 128);
    reader.setup().expect("setup reader");

    writer.write(b"cross-handle payload").expect("write");
    let data = reader.read().expect("read");
    assert!(data.starts_with(b"cross-handle payload"));

    reader.close();
    writer.unlink().expect("unlink");
}

#[test]
fn write_locked_round_trip() {
    let mut region = fresh_region("locked_write", 64);
    assert!(region.write_locked(b"guarded", 2000).expect("write_locked"));
    assert!(region.read().expect("read").starts_with(b"guarded"));
}

#[test]
fn write_locked_times_out_under_contention() {
    let id = unique_id("locked_timeout");
    let mut holder = SharedRegion::new(&id, 64);
    holder.unlink().expect("stale cleanup");
    holder.setup().expect("setup");
    assert!(holder.lock_for_writing(1000).expect("lock"));

    let mut contender = SharedRegion::new(&id, 64);
    contender.setup().expect("setup");
    let wrote = contender.write_locked(b"late", 150).expect("write_locked");
    assert!(!wrote, "write under a held lock must time out");

    holder.unlock_from_writing();
    assert!(contender.write_locked(b"late", 1000).expect("write_locked"));
}

// Two writers race full-buffer patterns through the advisory lock; every
// read under the lock must observe one pattern or the other, never a blend.
#[test]
fn locked_writers_never_tear() {
    let id = unique_id("no_tear");
    let mut seed = SharedRegion::new(&id, 256);
    seed.unlink().expect("stale cleanup");
    seed.setup().expect("setup");
    seed.write(&[0x11; 256]).expect("seed");

    let mut writers = Vec::new();
    for pattern in [0x11u8, 0x22] {
        let id = id.clone();
        writers.push(thread::spawn(move || {
            let mut region = SharedRegion::new(&id, 256);
            region.setup().expect("setup");
            for _ in 0..25 {
                assert!(region.write_locked(&[pattern; 256], 2000).expect("write"));
            }
        }));
    }

    let mut checker = SharedRegion::new(&id, 256);
    checker.setup().expect("setup");
    for _ in 0..50 {
        assert!(checker.lock_for_writing(2000).expect("lock"));
        let data = checker.read().expect("read");
        checker.unlock_from_writing();
        let first = data[0];
        assert!(data.iter().all(|&b| b == first), "torn write observed");
        thread::sleep(Duration::from_millis(1));
    }

    for w in writers {
        w.join().unwrap();
    }
}

#[test]
fn close_is_idempotent() {
    let mut region = fresh_region("double_close", 64);
    region.close();
    region.close();
}

#[test]
fn unlink_is_idempotent() {
    let mut region = fresh_region("double_unlink", 64);
    region.unlink().expect("first unlink");
    region.unlink().expect("second unlink");
}

#[test]
fn setup_preserves_existing_file_contents() {
    let id = unique_id("persist");
    {
        let mut region = SharedRegion::new(&id, 64);
        region.unlink().expect("stale cleanup");
        region.setup().expect("setup");
        region.write(b"durable bytes").expect("write");
        region.close();
    }
    let mut region = SharedRegion::new(&id, 64);
    region.setup().expect("re-setup");
    assert!(region.read().expect("read").starts_with(b"durable bytes"));
    region.unlink().expect("cleanup");
}
