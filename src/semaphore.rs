// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-platform named counting semaphore.
// Delegates to platform::PlatformSemaphore (POSIX or Windows).

use std::io;

use crate::platform::PlatformSemaphore;

/// A named, inter-process counting semaphore.
///
/// POSIX: `sem_open` family. Windows: `CreateSemaphore` with the maximum
/// count pinned at `i32::MAX`. The initial count only applies to the call
/// that creates the object; later opens join the existing state.
pub struct IpcSemaphore {
    inner: PlatformSemaphore,
}

impl IpcSemaphore {
    /// Open (or create) a named semaphore with `initial` credits.
    pub fn open(name: &str, initial: u32) -> io::Result<Self> {
        let inner = PlatformSemaphore::open(name, initial)?;
        Ok(Self { inner })
    }

    /// Take one credit. `None` blocks indefinitely; `Some(ms)` returns
    /// `Ok(false)` when the timeout expires first.
    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        self.inner.wait(timeout_ms)
    }

    /// Take one credit if immediately available.
    pub fn try_wait(&self) -> io::Result<bool> {
        self.inner.try_wait()
    }

    /// Release `n` credits.
    pub fn post(&self, n: u32) -> io::Result<()> {
        self.inner.post(n)
    }

    /// Remove the backing storage for a named semaphore (static helper).
    pub fn clear_storage(name: &str) {
        PlatformSemaphore::clear_storage(name);
    }
}
