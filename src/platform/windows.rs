// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows implementation of the shared memory, file region, mutex, semaphore,
// advisory file lock, and named pipe primitives.

use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, ERROR_PIPE_BUSY,
    ERROR_PIPE_CONNECTED, ERROR_SHARING_VIOLATION, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, GetFileSizeEx, ReadFile, SetEndOfFile, SetFilePointerEx,
    WriteFile, CREATE_ALWAYS, FILE_ATTRIBUTE_NORMAL, FILE_BEGIN, FILE_FLAG_DELETE_ON_CLOSE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_ALWAYS, OPEN_EXISTING,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, FlushViewOfFile, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile,
    VirtualQuery, FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
    PAGE_READWRITE, SEC_COMMIT,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_ACCESS_DUPLEX, PIPE_READMODE_BYTE,
    PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{
    CreateMutexW, CreateSemaphoreW, ReleaseMutex, ReleaseSemaphore, WaitForSingleObject, INFINITE,
};

// ---------------------------------------------------------------------------
// Layout helpers for the trailing reference counter.
// ---------------------------------------------------------------------------

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

pub(crate) fn calc_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

unsafe fn acc_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

/// Encode a name as a null-terminated wide string for Win32 APIs.
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn path_to_wide(p: &Path) -> Vec<u16> {
    p.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

// ---------------------------------------------------------------------------
// PlatformShm — Windows shared memory via pagefile-backed file mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct PlatformShm {
    handle: HANDLE,
    mem: *mut u8,
    size: usize,      // total mapped size
    user_size: usize, // user-visible size
    prev_ref: i32,
}

unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    pub fn acquire(name: &str, user_size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 && mode != ShmMode::Open {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let wide_name = to_wide(name);

        let handle;
        let total_size;

        if mode == ShmMode::Open {
            handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide_name.as_ptr()) };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            total_size = 0; // discovered after mapping
        } else {
            total_size = calc_size(user_size);
            handle = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    ptr::null(),
                    PAGE_READWRITE | SEC_COMMIT,
                    0,
                    total_size as u32,
                    wide_name.as_ptr(),
                )
            };
            let err = unsafe { GetLastError() };
            if mode == ShmMode::Create && err == ERROR_ALREADY_EXISTS {
                if !handle.is_null() {
                    unsafe { CloseHandle(handle) };
                }
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "shm already exists",
                ));
            }
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
        };

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        let mem = view.Value as *mut u8;
        if mem.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(e);
        }

        // Discover the actual size if opening an existing mapping.
        let (final_total, final_user) = if total_size == 0 {
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            let ret = unsafe {
                VirtualQuery(
                    mem as *const _,
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if ret == 0 {
                let e = io::Error::last_os_error();
                unsafe {
                    UnmapViewOfFile(view);
                    CloseHandle(handle);
                }
                return Err(e);
            }
            let actual = info.RegionSize;
            let u = actual - std::mem::size_of::<AtomicI32>();
            (actual, u)
        } else {
            (total_size, user_size)
        };

        let prev = unsafe { acc_of(mem, final_total).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            handle,
            mem,
            size: final_total,
            user_size: final_user,
            prev_ref: prev,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn mapped_size(&self) -> usize {
        self.size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() || self.size == 0 {
            return 0;
        }
        unsafe { acc_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    pub fn unlink(&self) {
        // Pagefile-backed mappings vanish when the last handle closes.
    }

    pub fn unlink_by_name(_name: &str) {
        // No-op on Windows.
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if !self.mem.is_null() && self.size > 0 {
            unsafe { acc_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
            let view = MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.mem as *mut _,
            };
            unsafe { UnmapViewOfFile(view) };
        }
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformFileRegion — file-backed named mapping at an explicit path
// ---------------------------------------------------------------------------

pub struct PlatformFileRegion {
    file: HANDLE,
    mapping: HANDLE,
    mem: *mut u8,
    size: usize,
}

unsafe impl Send for PlatformFileRegion {}
unsafe impl Sync for PlatformFileRegion {}

impl PlatformFileRegion {
    /// Open-or-create the backing file, extend it to `size` bytes if it is
    /// zero-length, and map it through a file mapping named `name`.
    pub fn open(path: &Path, size: usize, name: &str) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }
        let wide_path = path_to_wide(path);

        let file = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_ALWAYS,
                FILE_ATTRIBUTE_NORMAL,
                ptr::null_mut(),
            )
        };
        if file == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        let mut file_size: i64 = 0;
        if unsafe { GetFileSizeEx(file, &mut file_size) } == 0 {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(file) };
            return Err(e);
        }
        if file_size == 0 {
            let want = size as i64;
            let ok = unsafe {
                SetFilePointerEx(file, want, ptr::null_mut(), FILE_BEGIN) != 0
                    && SetEndOfFile(file) != 0
                    && SetFilePointerEx(file, 0, ptr::null_mut(), FILE_BEGIN) != 0
            };
            if !ok {
                let e = io::Error::last_os_error();
                unsafe { CloseHandle(file) };
                return Err(e);
            }
        }

        let wide_name = to_wide(name);
        let mapping = unsafe {
            CreateFileMappingW(
                file,
                ptr::null(),
                PAGE_READWRITE,
                0,
                size as u32,
                wide_name.as_ptr(),
            )
        };
        if mapping.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(file) };
            return Err(e);
        }

        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        let mem = view.Value as *mut u8;
        if mem.is_null() {
            let e = io::Error::last_os_error();
            unsafe {
                CloseHandle(mapping);
                CloseHandle(file);
            }
            return Err(e);
        }

        Ok(Self {
            file,
            mapping,
            mem,
            size,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    /// Flush the first `len` mapped bytes back to the file.
    pub fn flush(&self, len: usize) -> io::Result<()> {
        let len = len.min(self.size);
        if len == 0 {
            return Ok(());
        }
        if unsafe { FlushViewOfFile(self.mem as *const _, len) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Unmap and close all handles. Idempotent.
    pub fn close(&mut self) {
        if !self.mem.is_null() {
            let view = MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.mem as *mut _,
            };
            unsafe { UnmapViewOfFile(view) };
            self.mem = ptr::null_mut();
        }
        if !self.mapping.is_null() {
            unsafe { CloseHandle(self.mapping) };
            self.mapping = ptr::null_mut();
        }
        if self.file != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.file) };
            self.file = INVALID_HANDLE_VALUE;
        }
    }

    /// Delete the backing file. Idempotent on absent files.
    pub fn delete_backing(path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for PlatformFileRegion {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// PlatformFileLock — exclusive lock file with delete-on-close
// ---------------------------------------------------------------------------

/// A held advisory lock: an exclusively created lock file with
/// `FILE_FLAG_DELETE_ON_CLOSE`. Dropping the handle (or process death)
/// deletes the file and lifts the lock.
pub struct PlatformFileLock {
    handle: HANDLE,
}

unsafe impl Send for PlatformFileLock {}

impl PlatformFileLock {
    /// Try to create the lock file exclusively, polling every 10 ms on
    /// sharing violations until `timeout` elapses. Returns `Ok(None)` on
    /// timeout; other failures surface as `Err`.
    pub fn acquire(path: &Path, timeout: Duration) -> io::Result<Option<Self>> {
        let wide_path = path_to_wide(path);
        let deadline = Instant::now() + timeout;

        loop {
            let handle = unsafe {
                CreateFileW(
                    wide_path.as_ptr(),
                    GENERIC_WRITE,
                    0, // no sharing — exclusive access
                    ptr::null(),
                    CREATE_ALWAYS,
                    FILE_ATTRIBUTE_NORMAL | FILE_FLAG_DELETE_ON_CLOSE,
                    ptr::null_mut(),
                )
            };
            if handle != INVALID_HANDLE_VALUE {
                return Ok(Some(Self { handle }));
            }
            let err = unsafe { GetLastError() };
            if err != ERROR_SHARING_VIOLATION {
                return Err(io::Error::last_os_error());
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for PlatformFileLock {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// PlatformMutex — Windows named mutex
// ---------------------------------------------------------------------------

pub struct PlatformMutex {
    handle: HANDLE,
}

unsafe impl Send for PlatformMutex {}
unsafe impl Sync for PlatformMutex {}

impl PlatformMutex {
    pub fn open(name: &str) -> io::Result<Self> {
        let wide_name = to_wide(name);
        let h = unsafe { CreateMutexW(ptr::null(), 0, wide_name.as_ptr()) };
        if h.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle: h })
    }

    /// Lock the mutex (blocking).
    pub fn lock(&self) -> io::Result<()> {
        match unsafe { WaitForSingleObject(self.handle, INFINITE) } {
            WAIT_OBJECT_0 => Ok(()),
            // Previous owner died while holding the mutex — we now own it.
            WAIT_ABANDONED => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Lock the mutex with a timeout in milliseconds.
    /// Returns `Ok(true)` if acquired, `Ok(false)` on timeout.
    pub fn lock_timeout(&self, timeout_ms: u64) -> io::Result<bool> {
        let ms = timeout_ms.min(u32::MAX as u64 - 1) as u32;
        match unsafe { WaitForSingleObject(self.handle, ms) } {
            WAIT_OBJECT_0 | WAIT_ABANDONED => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Try to lock the mutex without blocking.
    pub fn try_lock(&self) -> io::Result<bool> {
        self.lock_timeout(0)
    }

    /// Unlock the mutex.
    pub fn unlock(&self) -> io::Result<()> {
        if unsafe { ReleaseMutex(self.handle) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn clear_storage(_name: &str) {
        // Kernel objects vanish with their last handle; nothing to remove.
    }
}

impl Drop for PlatformMutex {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformSemaphore — Windows named semaphore
// ---------------------------------------------------------------------------

pub struct PlatformSemaphore {
    handle: HANDLE,
}

unsafe impl Send for PlatformSemaphore {}
unsafe impl Sync for PlatformSemaphore {}

impl PlatformSemaphore {
    /// Open (or create) a named semaphore. `initial` only applies when this
    /// call creates the object.
    pub fn open(name: &str, initial: u32) -> io::Result<Self> {
        let wide_name = to_wide(name);
        let h = unsafe {
            CreateSemaphoreW(
                ptr::null(),
                initial as i32,
                i32::MAX,
                wide_name.as_ptr(),
            )
        };
        if h.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle: h })
    }

    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        let ms = match timeout_ms {
            None => INFINITE,
            Some(ms) => ms.min(u32::MAX as u64 - 1) as u32,
        };
        match unsafe { WaitForSingleObject(self.handle, ms) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn try_wait(&self) -> io::Result<bool> {
        self.wait(Some(0))
    }

    pub fn post(&self, n: u32) -> io::Result<()> {
        if n == 0 {
            return Ok(());
        }
        if unsafe { ReleaseSemaphore(self.handle, n as i32, ptr::null_mut()) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn clear_storage(_name: &str) {
        // Kernel objects vanish with their last handle; nothing to remove.
    }
}

impl Drop for PlatformSemaphore {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// PlatformPipe — Windows duplex named pipe
// ---------------------------------------------------------------------------

const PIPE_BUFFER_SIZE: u32 = 65536;

pub struct PlatformPipe {
    handle: HANDLE,
    server: bool,
}

unsafe impl Send for PlatformPipe {}

impl PlatformPipe {
    fn pipe_path(name: &str) -> String {
        format!(r"\\.\pipe\{name}")
    }

    /// Server side: create the pipe and block until a client connects.
    pub fn create(name: &str) -> io::Result<Self> {
        let wide = to_wide(&Self::pipe_path(name));
        let handle = unsafe {
            CreateNamedPipeW(
                wide.as_ptr(),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                ptr::null(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        let ok = unsafe { ConnectNamedPipe(handle, ptr::null_mut()) };
        if ok == 0 && unsafe { GetLastError() } != ERROR_PIPE_CONNECTED {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(e);
        }
        Ok(Self {
            handle,
            server: true,
        })
    }

    /// Client side: connect to an existing pipe, retrying while the server
    /// is not ready yet.
    pub fn connect(name: &str, timeout: Duration) -> io::Result<Self> {
        let wide = to_wide(&Self::pipe_path(name));
        let deadline = Instant::now() + timeout;

        loop {
            let handle = unsafe {
                CreateFileW(
                    wide.as_ptr(),
                    GENERIC_READ | GENERIC_WRITE,
                    0,
                    ptr::null(),
                    OPEN_EXISTING,
                    0,
                    ptr::null_mut(),
                )
            };
            if handle != INVALID_HANDLE_VALUE {
                return Ok(Self {
                    handle,
                    server: false,
                });
            }
            let err = unsafe { GetLastError() };
            let transient = err == ERROR_FILE_NOT_FOUND || err == ERROR_PIPE_BUSY;
            if !transient || Instant::now() >= deadline {
                return Err(io::Error::last_os_error());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Write the whole buffer.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut written: u32 = 0;
            let ok = unsafe {
                WriteFile(
                    self.handle,
                    buf.as_ptr(),
                    buf.len() as u32,
                    &mut written,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            buf = &buf[written as usize..];
        }
        let _ = unsafe { FlushFileBuffers(self.handle) };
        Ok(())
    }

    /// Read exactly `buf.len()` bytes. `Ok(false)` means the peer closed
    /// the pipe before any byte arrived.
    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<bool> {
        let mut read = 0usize;
        while read < buf.len() {
            let mut got: u32 = 0;
            let ok = unsafe {
                ReadFile(
                    self.handle,
                    buf[read..].as_mut_ptr(),
                    (buf.len() - read) as u32,
                    &mut got,
                    ptr::null_mut(),
                )
            };
            if ok == 0 || got == 0 {
                if read == 0 {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pipe closed mid-message",
                ));
            }
            read += got as usize;
        }
        Ok(true)
    }
}

impl Drop for PlatformPipe {
    fn drop(&mut self) {
        if self.server {
            unsafe { DisconnectNamedPipe(self.handle) };
        }
        unsafe { CloseHandle(self.handle) };
    }
}
