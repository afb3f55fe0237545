// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named advisory file lock: the write-side critical section for a
// file-backed shared region. Only processes that honor the lock are
// serialized.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;

use crate::platform::PlatformFileLock;

/// An exclusive, bounded-wait advisory lock rooted next to a backing file.
///
/// The lock lives at `<base_path>.lock`. The OS lifts it automatically when
/// the holding process exits, including abnormal exit, so a crashed holder
/// never wedges its peers.
pub struct AdvisoryLock {
    lock_path: PathBuf,
    held: Option<PlatformFileLock>,
}

impl AdvisoryLock {
    /// Create a lock rooted at `base_path` (the path of the resource being
    /// guarded). Does not take the lock.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let mut lock_path = base_path.into().into_os_string();
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
            held: None,
        }
    }

    /// Path of the companion lock file.
    pub fn lock_path(&self) -> &std::path::Path {
        &self.lock_path
    }

    /// Whether this instance currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Acquire the lock, polling every 10 ms while another process holds it.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` when `timeout_ms`
    /// elapses first. Acquiring while already held is a no-op success.
    /// Failures unrelated to contention surface as `Err`.
    pub fn acquire(&mut self, timeout_ms: u64) -> io::Result<bool> {
        if self.held.is_some() {
            debug!("lock {:?} already acquired", self.lock_path);
            return Ok(true);
        }
        match PlatformFileLock::acquire(&self.lock_path, Duration::from_millis(timeout_ms))? {
            Some(held) => {
                self.held = Some(held);
                Ok(true)
            }
            None => {
                debug!(
                    "lock {:?} not acquired within {timeout_ms} ms",
                    self.lock_path
                );
                Ok(false)
            }
        }
    }

    /// Release the lock. Idempotent: returns `false` when not held.
    pub fn release(&mut self) -> bool {
        match self.held.take() {
            Some(held) => {
                drop(held);
                true
            }
            None => false,
        }
    }

    /// Release if held.
    pub fn close(&mut self) {
        self.release();
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        self.close();
    }
}
