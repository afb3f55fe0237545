// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Named, file-backed fixed-size shared memory region with an advisory
// write lock. The region is a flat byte array: interpretation is entirely
// the caller's.

use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::lock::AdvisoryLock;
use crate::platform::PlatformFileRegion;

fn not_set_up() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "region not set up")
}

/// A named shared memory region backed by `<OS_TEMP>/<id>.bin`.
///
/// The `id` doubles as the OS-wide mapping name, so any process that knows
/// it can attach. Writers that want cross-process exclusion use
/// [`write_locked`](SharedRegion::write_locked); plain [`write`]
/// (SharedRegion::write) is not synchronized.
pub struct SharedRegion {
    id: String,
    size: usize,
    file_path: PathBuf,
    mapped: Option<PlatformFileRegion>,
    lock: AdvisoryLock,
}

impl SharedRegion {
    /// Describe a region named `id` of exactly `size` bytes. No OS resources
    /// are touched until [`setup`](SharedRegion::setup).
    pub fn new(id: &str, size: usize) -> Self {
        let file_path = std::env::temp_dir().join(format!("{id}.bin"));
        let lock = AdvisoryLock::new(&file_path);
        Self {
            id: id.to_string(),
            size,
            file_path,
            mapped: None,
            lock,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Open-or-create the backing file, extend it to `size` bytes if it is
    /// brand new, and map it. Idempotent once mapped.
    pub fn setup(&mut self) -> io::Result<()> {
        if self.mapped.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        let mapped = PlatformFileRegion::open(&self.file_path, self.size)?;
        #[cfg(windows)]
        let mapped = PlatformFileRegion::open(&self.file_path, self.size, &self.id)?;
        debug!("region '{}' mapped at {:?}", self.id, self.file_path);
        self.mapped = Some(mapped);
        Ok(())
    }

    /// Copy `data` to the start of the region and flush the written prefix.
    /// Not internally synchronized; see [`write_locked`](Self::write_locked).
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mapped = self.mapped.as_ref().ok_or_else(not_set_up)?;
        if data.len() > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write of {} bytes exceeds region size {}", data.len(), self.size),
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_mut_ptr(), data.len());
        }
        mapped.flush(data.len())
    }

    /// `write` bracketed by the advisory lock. Returns `Ok(false)` when the
    /// lock could not be taken within `timeout_ms`; nothing is written then.
    pub fn write_locked(&mut self, data: &[u8], timeout_ms: u64) -> io::Result<bool> {
        if !self.lock.acquire(timeout_ms)? {
            return Ok(false);
        }
        let result = self.write(data);
        self.lock.release();
        result?;
        Ok(true)
    }

    /// Take the advisory write lock without writing. Pairs with
    /// [`unlock_from_writing`](Self::unlock_from_writing).
    pub fn lock_for_writing(&mut self, timeout_ms: u64) -> io::Result<bool> {
        self.lock.acquire(timeout_ms)
    }

    /// Release the advisory write lock. Idempotent `false` if not held.
    pub fn unlock_from_writing(&mut self) -> bool {
        self.lock.release()
    }

    /// Owned copy of the full region.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        let mapped = self.mapped.as_ref().ok_or_else(not_set_up)?;
        let mut buf = vec![0u8; self.size];
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr(), buf.as_mut_ptr(), self.size);
        }
        Ok(buf)
    }

    /// The region contents up to (excluding) the first NUL byte, as a string.
    pub fn read_string(&self) -> io::Result<String> {
        let buf = self.read()?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Interpret the first 4 bytes as a u32 LE length `L`, then return the
    /// next `L` bytes. `Ok(None)` when `L` does not fit the region.
    pub fn read_length_prefixed(&self) -> io::Result<Option<Vec<u8>>> {
        let mapped = self.mapped.as_ref().ok_or_else(not_set_up)?;
        if self.size < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr(), len_bytes.as_mut_ptr(), 4);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.size - 4 {
            debug!(
                "region '{}': length prefix {len} exceeds usable size {}",
                self.id,
                self.size - 4
            );
            return Ok(None);
        }
        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(mapped.as_ptr().add(4), buf.as_mut_ptr(), len);
        }
        Ok(Some(buf))
    }

    /// Zero the entire region and flush.
    pub fn clear(&self) -> io::Result<()> {
        let mapped = self.mapped.as_ref().ok_or_else(not_set_up)?;
        unsafe {
            std::ptr::write_bytes(mapped.as_mut_ptr(), 0, self.size);
        }
        mapped.flush(self.size)
    }

    /// Unmap and close the backing handles. Idempotent.
    pub fn close(&mut self) {
        self.lock.close();
        self.mapped = None;
    }

    /// Close, then delete the backing file. Idempotent on absent files.
    pub fn unlink(&mut self) -> io::Result<()> {
        self.close();
        PlatformFileRegion::delete_backing(&self.file_path)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if self.mapped.is_some() {
            debug!("region '{}' dropped while mapped; closing", self.id);
        }
        self.close();
    }
}
