// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Advisory lock tests: mutual exclusion, bounded waits, idempotent release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossipc::AdvisoryLock;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_base(prefix: &str) -> std::path::PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("{prefix}_lock_{n}.bin"))
}

#[test]
fn acquire_release_acquire() {
    let base = unique_base("arr");
    let mut lock = AdvisoryLock::new(&base);

    assert!(lock.acquire(1000).expect("first acquire"));
    assert!(lock.release());
    assert!(lock.acquire(1000).expect("second acquire"));
    assert!(lock.release());
}

#[test]
fn reacquire_while_held_is_noop_success() {
    let base = unique_base("reacquire");
    let mut lock = AdvisoryLock::new(&base);

    assert!(lock.acquire(1000).unwrap());
    assert!(lock.acquire(1000).unwrap());
    assert!(lock.is_held());
    assert!(lock.release());
    // Only one level of holding: the second release has nothing to drop.
    assert!(!lock.release());
}

#[test]
fn release_without_acquire_returns_false() {
    let base = unique_base("bare_release");
    let mut lock = AdvisoryLock::new(&base);
    assert!(!lock.release());
}

#[test]
fn second_holder_times_out() {
    let base = unique_base("contention");
    let mut first = AdvisoryLock::new(&base);
    assert!(first.acquire(1000).unwrap());

    let mut second = AdvisoryLock::new(&base);
    let start = Instant::now();
    let got = second.acquire(200).unwrap();
    assert!(!got, "second holder must time out while the first holds");
    assert!(
        start.elapsed() >= Duration::from_millis(200),
        "timeout returned too early"
    );

    first.release();
    assert!(second.acquire(1000).unwrap());
    second.release();
}

#[test]
fn lock_passes_between_threads() {
    let base = unique_base("handoff");
    let mut lock = AdvisoryLock::new(&base);
    assert!(lock.acquire(1000).unwrap());

    let base2 = base.clone();
    let waiter = thread::spawn(move || {
        let mut lock = AdvisoryLock::new(&base2);
        // Generous bound: the main thread releases after 100 ms.
        let got = lock.acquire(2000).unwrap();
        if got {
            lock.release();
        }
        got
    });

    thread::sleep(Duration::from_millis(100));
    lock.release();
    assert!(waiter.join().unwrap(), "waiter should get the lock after release");
}

#[test]
fn lock_path_is_derived_from_base() {
    let base = unique_base("path");
    let lock = AdvisoryLock::new(&base);
    let expected = format!("{}.lock", base.display());
    assert_eq!(lock.lock_path().display().to_string(), expected);
}

#[test]
fn close_releases() {
    let base = unique_base("close");
    let mut lock = AdvisoryLock::new(&base);
    assert!(lock.acquire(1000).unwrap());
    lock.close();
    assert!(!lock.is_held());

    let mut other = AdvisoryLock::new(&base);
    assert!(other.acquire(500).unwrap());
    other.release();
}
