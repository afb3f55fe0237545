// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named inter-process mutex tests.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossipc::IpcMutex;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_mtx_{n}")
}

#[test]
fn open_and_drop() {
    let name = unique_name("named_ctor");
    IpcMutex::clear_storage(&name);

    let mtx = IpcMutex::open(&name).expect("open");
    drop(mtx);
}

#[test]
fn clear_storage_allows_reopen() {
    let name = unique_name("clear_storage");
    IpcMutex::clear_storage(&name);

    {
        let _mtx = IpcMutex::open(&name).expect("open");
    }

    IpcMutex::clear_storage(&name);

    let mtx2 = IpcMutex::open(&name).expect("reopen after clear");
    drop(mtx2);
}

#[test]
fn lock_unlock() {
    let name = unique_name("lock_unlock");
    IpcMutex::clear_storage(&name);

    let mtx = IpcMutex::open(&name).expect("open");

    mtx.lock().expect("lock");
    mtx.unlock().expect("unlock");
}

#[test]
fn try_lock_uncontended() {
    let name = unique_name("try_lock");
    IpcMutex::clear_storage(&name);

    let mtx = IpcMutex::open(&name).expect("open");

    assert!(mtx.try_lock().expect("try_lock"));
    mtx.unlock().expect("unlock");
}

#[test]
fn lock_timeout_uncontended_succeeds() {
    let name = unique_name("timed_free");
    IpcMutex::clear_storage(&name);

    let mtx = IpcMutex::open(&name).expect("open");
    assert!(mtx.lock_timeout(100).expect("lock_timeout"));
    mtx.unlock().expect("unlock");
}

#[test]
fn lock_timeout_expires_under_contention() {
    let name = unique_name("timed_held");
    IpcMutex::clear_storage(&name);

    let holder = IpcMutex::open(&name).expect("open holder");
    holder.lock().expect("lock");

    let name_t = name.clone();
    let waiter = thread::spawn(move || {
        let mtx = IpcMutex::open(&name_t).expect("open waiter");
        let start = Instant::now();
        let got = mtx.lock_timeout(150).expect("lock_timeout");
        (got, start.elapsed())
    });

    let (got, elapsed) = waiter.join().unwrap();
    assert!(!got, "bounded wait must expire while the lock is held");
    assert!(elapsed >= Duration::from_millis(100));

    holder.unlock().expect("unlock");
}

#[test]
fn critical_section_counts_exactly() {
    let name = unique_name("critical_section");
    IpcMutex::clear_storage(&name);

    let counter = Arc::new(AtomicI32::new(0));
    let iterations = 100;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let name = name.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let mtx = IpcMutex::open(&name).expect("open");
                for _ in 0..iterations {
                    mtx.lock().expect("lock");
                    counter.fetch_add(1, Ordering::Relaxed);
                    mtx.unlock().expect("unlock");
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), iterations * 2);
}

#[test]
fn mutual_exclusion_holds() {
    let name = unique_name("contention");
    IpcMutex::clear_storage(&name);

    let thread1_in_cs = Arc::new(AtomicBool::new(false));
    let thread2_in_cs = Arc::new(AtomicBool::new(false));
    let violation = Arc::new(AtomicBool::new(false));

    let make_task = |my_flag: Arc<AtomicBool>,
                     other_flag: Arc<AtomicBool>,
                     viol: Arc<AtomicBool>,
                     name: String| {
        thread::spawn(move || {
            let mtx = IpcMutex::open(&name).expect("open");
            for _ in 0..50 {
                mtx.lock().expect("lock");

                my_flag.store(true, Ordering::SeqCst);
                if other_flag.load(Ordering::SeqCst) {
                    viol.store(true, Ordering::SeqCst);
                }

                thread::sleep(Duration::from_micros(10));

                my_flag.store(false, Ordering::SeqCst);
                mtx.unlock().expect("unlock");

                thread::yield_now();
            }
        })
    };

    let t1 = make_task(
        Arc::clone(&thread1_in_cs),
        Arc::clone(&thread2_in_cs),
        Arc::clone(&violation),
        name.clone(),
    );
    let t2 = make_task(
        Arc::clone(&thread2_in_cs),
        Arc::clone(&thread1_in_cs),
        Arc::clone(&violation),
        name.clone(),
    );

    t1.join().unwrap();
    t2.join().unwrap();

    assert!(
        !violation.load(Ordering::SeqCst),
        "both threads in critical section simultaneously"
    );
}

#[test]
fn try_lock_contended_returns_false() {
    let name = unique_name("try_contended");
    IpcMutex::clear_storage(&name);

    let mtx_main = IpcMutex::open(&name).expect("open main");
    mtx_main.lock().expect("lock main");

    let contended = Arc::new(AtomicBool::new(false));
    let contended_ref = Arc::clone(&contended);
    let name_t = name.clone();

    let t = thread::spawn(move || {
        let mtx = IpcMutex::open(&name_t).expect("open thread");
        match mtx.try_lock() {
            Ok(true) => mtx.unlock().expect("unlock"),
            Ok(false) => contended_ref.store(true, Ordering::SeqCst),
            Err(e) => panic!("try_lock error: {e}"),
        }
    });

    t.join().unwrap();
    mtx_main.unlock().expect("unlock main");

    assert!(
        contended.load(Ordering::SeqCst),
        "try_lock should have been contended"
    );
}

#[test]
fn rapid_lock_unlock_two_threads() {
    let name = unique_name("rapid");
    IpcMutex::clear_storage(&name);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let name = name.clone();
            thread::spawn(move || {
                let mtx = IpcMutex::open(&name).expect("open");
                for _ in 0..1000 {
                    mtx.lock().expect("lock");
                    mtx.unlock().expect("unlock");
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn high_contention_counts_exactly() {
    let name = unique_name("high_contention");
    IpcMutex::clear_storage(&name);

    let counter = Arc::new(AtomicI32::new(0));
    let num_threads = 8;
    let ops_per_thread = 50;

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let name = name.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let mtx = IpcMutex::open(&name).expect("open");
                for _ in 0..ops_per_thread {
                    mtx.lock().expect("lock");
                    counter.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_micros(100));
                    mtx.unlock().expect("unlock");
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.load(Ordering::Relaxed), num_threads * ops_per_thread);
}
