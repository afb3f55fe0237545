// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded, fixed-item-size ring buffer in named shared memory, coordinated
// across processes by one named mutex and two counting semaphores
// (not-empty and not-full).
//
// Region layout (packed, native-endian):
//
//   header: mode i32 | head usize | tail usize | count usize
//         | capacity usize | item_size usize
//   slots:  capacity × { size usize | data [item_size] }
//
// The header is packed, so every access goes through unaligned reads and
// writes of a header copy taken under the mutex.

use std::io;
use std::ptr;

use log::debug;

use crate::mutex::IpcMutex;
use crate::semaphore::IpcSemaphore;
use crate::shm::{ShmHandle, ShmOpenMode};

/// Bounded wait on the capacity semaphores.
const SEM_TIMEOUT_MS: u64 = 1_000;

/// Operating mode of a dispenser, fixed by the provider at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispenserMode {
    /// Queue: dispense returns items in add order.
    Fifo,
    /// Stack: dispense returns the most recently added item.
    Lifo,
    /// Double-ended: add/dispense/peek at both ends.
    Deque,
}

impl DispenserMode {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Fifo),
            1 => Some(Self::Lifo),
            2 => Some(Self::Deque),
            _ => None,
        }
    }

    fn as_raw(self) -> i32 {
        match self {
            Self::Fifo => 0,
            Self::Lifo => 1,
            Self::Deque => 2,
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct DispenserHeader {
    mode: i32,
    head: usize,
    tail: usize,
    count: usize,
    capacity: usize,
    item_size: usize,
}

const HEADER_SIZE: usize = std::mem::size_of::<DispenserHeader>();
const SLOT_PREFIX: usize = std::mem::size_of::<usize>();

fn region_size(capacity: usize, item_size: usize) -> usize {
    HEADER_SIZE + capacity * (SLOT_PREFIX + item_size)
}

/// A bounded cross-process dispenser named `ShmDispenser_<id>`.
///
/// The process whose `setup` creates the region is the provider and owns
/// the header initialisation; later processes join as consumers by calling
/// `setup(0, 0)` and trust the provider's header.
pub struct ShmDispenser {
    id: String,
    mode: DispenserMode,
    shm: Option<ShmHandle>,
    mutex: Option<IpcMutex>,
    not_empty: Option<IpcSemaphore>,
    not_full: Option<IpcSemaphore>,
    is_provider: bool,
}

impl ShmDispenser {
    /// Describe a dispenser. `mode` only matters for the process that ends
    /// up creating the region; joiners inherit the provider's mode.
    pub fn new(id: &str, mode: DispenserMode) -> Self {
        Self {
            id: id.to_string(),
            mode,
            shm: None,
            mutex: None,
            not_empty: None,
            not_full: None,
            is_provider: false,
        }
    }

    fn region_name(id: &str) -> String {
        format!("ShmDispenser_{id}")
    }

    fn mutex_name(id: &str) -> String {
        format!("ShmDispenser_Mutex_{id}")
    }

    fn not_empty_name(id: &str) -> String {
        format!("ShmDispenser_NotEmpty_{id}")
    }

    fn not_full_name(id: &str) -> String {
        format!("ShmDispenser_NotFull_{id}")
    }

    /// Open or create the shared region and its coordination primitives.
    ///
    /// A provider passes the desired `capacity` and `item_size`; a consumer
    /// passes `0, 0` to join an existing dispenser without touching the
    /// header. Joining a dispenser that does not exist yet fails.
    pub fn setup(&mut self, capacity: usize, item_size: usize) -> io::Result<()> {
        let region = Self::region_name(&self.id);

        // Open-first: an existing region makes this process a consumer.
        let shm = match ShmHandle::acquire(&region, 0, ShmOpenMode::Open) {
            Ok(shm) => {
                self.is_provider = false;
                shm
            }
            Err(open_err) => {
                if capacity == 0 || item_size == 0 {
                    return Err(open_err);
                }
                let shm = ShmHandle::acquire(
                    &region,
                    region_size(capacity, item_size),
                    ShmOpenMode::Create,
                )?;
                self.is_provider = true;
                shm
            }
        };

        if self.is_provider {
            let header = DispenserHeader {
                mode: self.mode.as_raw(),
                head: 0,
                tail: 0,
                count: 0,
                capacity,
                item_size,
            };
            unsafe { ptr::write_unaligned(shm.get() as *mut DispenserHeader, header) };
        } else {
            let header =
                unsafe { ptr::read_unaligned(shm.get() as *const DispenserHeader) };
            match DispenserMode::from_raw(header.mode) {
                Some(mode) => self.mode = mode,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("dispenser '{}' header carries unknown mode", self.id),
                    ));
                }
            }
        }

        let header = unsafe { ptr::read_unaligned(shm.get() as *const DispenserHeader) };

        let mutex = IpcMutex::open(&Self::mutex_name(&self.id))?;
        let not_empty = IpcSemaphore::open(&Self::not_empty_name(&self.id), 0)?;
        let not_full =
            IpcSemaphore::open(&Self::not_full_name(&self.id), header.capacity as u32)?;

        debug!(
            "dispenser '{}' set up as {} (mode {:?}, capacity {}, item_size {})",
            self.id,
            if self.is_provider { "provider" } else { "consumer" },
            self.mode,
            { header.capacity },
            { header.item_size },
        );

        self.shm = Some(shm);
        self.mutex = Some(mutex);
        self.not_empty = Some(not_empty);
        self.not_full = Some(not_full);
        Ok(())
    }

    /// Whether this process created (and initialised) the region.
    pub fn is_provider(&self) -> bool {
        self.is_provider
    }

    /// The mode this dispenser operates in (the provider's choice).
    pub fn mode(&self) -> DispenserMode {
        self.mode
    }

    // ------------------------------------------------------------------
    // raw region access
    // ------------------------------------------------------------------

    fn header_ptr(&self) -> *mut DispenserHeader {
        self.shm.as_ref().expect("dispenser not set up").get() as *mut DispenserHeader
    }

    fn read_header(&self) -> DispenserHeader {
        unsafe { ptr::read_unaligned(self.header_ptr()) }
    }

    fn write_header(&self, header: &DispenserHeader) {
        unsafe { ptr::write_unaligned(self.header_ptr(), *header) };
    }

    fn slot_ptr(&self, index: usize, item_size: usize) -> *mut u8 {
        let base = self.shm.as_ref().expect("dispenser not set up").get();
        unsafe { base.add(HEADER_SIZE + index * (SLOT_PREFIX + item_size)) }
    }

    fn write_slot(&self, index: usize, item_size: usize, data: &[u8]) {
        let slot = self.slot_ptr(index, item_size);
        unsafe {
            ptr::write_unaligned(slot as *mut usize, data.len());
            ptr::copy_nonoverlapping(data.as_ptr(), slot.add(SLOT_PREFIX), data.len());
        }
    }

    fn read_slot(&self, index: usize, item_size: usize) -> Vec<u8> {
        let slot = self.slot_ptr(index, item_size);
        let stored = unsafe { ptr::read_unaligned(slot as *const usize) };
        // A size beyond the slot width can only come from a torn or foreign
        // write; clamp rather than read out of bounds.
        let len = stored.min(item_size);
        let mut buf = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(slot.add(SLOT_PREFIX), buf.as_mut_ptr(), len);
        }
        buf
    }

    // ------------------------------------------------------------------
    // operations
    // ------------------------------------------------------------------

    /// Add an item at the back (FIFO/DEQUE) or on top (LIFO).
    /// Returns `Ok(false)` when the dispenser is full for 1 s, the item is
    /// larger than `item_size`, or the dispenser is not set up.
    pub fn add(&self, item: &[u8]) -> io::Result<bool> {
        if self.shm.is_none() {
            return Ok(false);
        }
        let header = self.read_header();
        if item.len() > header.item_size {
            debug!(
                "dispenser '{}': item of {} bytes exceeds item_size {}",
                self.id,
                item.len(),
                { header.item_size },
            );
            return Ok(false);
        }

        let not_full = self.not_full.as_ref().unwrap();
        if !not_full.wait(Some(SEM_TIMEOUT_MS))? {
            debug!("dispenser '{}': full, add timed out", self.id);
            return Ok(false);
        }

        let mutex = self.mutex.as_ref().unwrap();
        if let Err(e) = mutex.lock() {
            let _ = not_full.post(1);
            return Err(e);
        }

        let mut header = self.read_header();
        let c = header.capacity;
        let slot = match DispenserMode::from_raw(header.mode).unwrap_or(self.mode) {
            DispenserMode::Fifo | DispenserMode::Deque => {
                let slot = header.tail;
                header.tail = (header.tail + 1) % c;
                slot
            }
            DispenserMode::Lifo => {
                header.head = (header.head + c - 1) % c;
                header.head
            }
        };
        self.write_slot(slot, header.item_size, item);
        header.count += 1;
        self.write_header(&header);

        mutex.unlock()?;
        self.not_empty.as_ref().unwrap().post(1)?;
        Ok(true)
    }

    /// Add an item at the front. DEQUE only.
    pub fn add_front(&self, item: &[u8]) -> io::Result<bool> {
        if self.shm.is_none() {
            return Ok(false);
        }
        let header = self.read_header();
        if DispenserMode::from_raw(header.mode) != Some(DispenserMode::Deque) {
            debug!("dispenser '{}': add_front requires DEQUE mode", self.id);
            return Ok(false);
        }
        if item.len() > header.item_size {
            debug!(
                "dispenser '{}': item of {} bytes exceeds item_size {}",
                self.id,
                item.len(),
                { header.item_size },
            );
            return Ok(false);
        }

        let not_full = self.not_full.as_ref().unwrap();
        if !not_full.wait(Some(SEM_TIMEOUT_MS))? {
            debug!("dispenser '{}': full, add_front timed out", self.id);
            return Ok(false);
        }

        let mutex = self.mutex.as_ref().unwrap();
        if let Err(e) = mutex.lock() {
            let _ = not_full.post(1);
            return Err(e);
        }

        let mut header = self.read_header();
        let c = header.capacity;
        header.head = (header.head + c - 1) % c;
        let slot = header.head;
        self.write_slot(slot, header.item_size, item);
        header.count += 1;
        self.write_header(&header);

        mutex.unlock()?;
        self.not_empty.as_ref().unwrap().post(1)?;
        Ok(true)
    }

    /// Remove and return the front item. `Ok(None)` when the dispenser stays
    /// empty for 1 s or is not set up.
    pub fn dispense(&self) -> io::Result<Option<Vec<u8>>> {
        if self.shm.is_none() {
            return Ok(None);
        }

        let not_empty = self.not_empty.as_ref().unwrap();
        if !not_empty.wait(Some(SEM_TIMEOUT_MS))? {
            debug!("dispenser '{}': empty, dispense timed out", self.id);
            return Ok(None);
        }

        let mutex = self.mutex.as_ref().unwrap();
        if let Err(e) = mutex.lock() {
            let _ = not_empty.post(1);
            return Err(e);
        }

        let mut header = self.read_header();
        let slot = header.head;
        header.head = (header.head + 1) % header.capacity;
        let item = self.read_slot(slot, header.item_size);
        header.count -= 1;
        self.write_header(&header);

        mutex.unlock()?;
        self.not_full.as_ref().unwrap().post(1)?;
        Ok(Some(item))
    }

    /// Remove and return the back item. DEQUE only.
    pub fn dispense_back(&self) -> io::Result<Option<Vec<u8>>> {
        if self.shm.is_none() {
            return Ok(None);
        }
        if DispenserMode::from_raw(self.read_header().mode) != Some(DispenserMode::Deque) {
            debug!("dispenser '{}': dispense_back requires DEQUE mode", self.id);
            return Ok(None);
        }

        let not_empty = self.not_empty.as_ref().unwrap();
        if !not_empty.wait(Some(SEM_TIMEOUT_MS))? {
            debug!("dispenser '{}': empty, dispense_back timed out", self.id);
            return Ok(None);
        }

        let mutex = self.mutex.as_ref().unwrap();
        if let Err(e) = mutex.lock() {
            let _ = not_empty.post(1);
            return Err(e);
        }

        let mut header = self.read_header();
        let c = header.capacity;
        header.tail = (header.tail + c - 1) % c;
        let slot = header.tail;
        let item = self.read_slot(slot, header.item_size);
        header.count -= 1;
        self.write_header(&header);

        mutex.unlock()?;
        self.not_full.as_ref().unwrap().post(1)?;
        Ok(Some(item))
    }

    /// Copy the front item without removing it. The not-empty credit taken
    /// to confirm non-emptiness is re-released, leaving the semaphore state
    /// unchanged.
    pub fn peek(&self) -> io::Result<Option<Vec<u8>>> {
        if self.shm.is_none() {
            return Ok(None);
        }

        let not_empty = self.not_empty.as_ref().unwrap();
        if !not_empty.wait(Some(SEM_TIMEOUT_MS))? {
            return Ok(None);
        }

        let mutex = self.mutex.as_ref().unwrap();
        if let Err(e) = mutex.lock() {
            let _ = not_empty.post(1);
            return Err(e);
        }

        let header = self.read_header();
        let item = self.read_slot(header.head, header.item_size);

        mutex.unlock()?;
        not_empty.post(1)?;
        Ok(Some(item))
    }

    /// Copy the back item without removing it. DEQUE only.
    pub fn peek_back(&self) -> io::Result<Option<Vec<u8>>> {
        if self.shm.is_none() {
            return Ok(None);
        }
        if DispenserMode::from_raw(self.read_header().mode) != Some(DispenserMode::Deque) {
            debug!("dispenser '{}': peek_back requires DEQUE mode", self.id);
            return Ok(None);
        }

        let not_empty = self.not_empty.as_ref().unwrap();
        if !not_empty.wait(Some(SEM_TIMEOUT_MS))? {
            return Ok(None);
        }

        let mutex = self.mutex.as_ref().unwrap();
        if let Err(e) = mutex.lock() {
            let _ = not_empty.post(1);
            return Err(e);
        }

        let header = self.read_header();
        let c = header.capacity;
        let slot = (header.tail + c - 1) % c;
        let item = self.read_slot(slot, header.item_size);

        mutex.unlock()?;
        not_empty.post(1)?;
        Ok(Some(item))
    }

    // String convenience wrappers: a trailing NUL travels with the bytes so
    // consumers in any language read the items as C strings.

    pub fn add_string(&self, item: &str) -> io::Result<bool> {
        self.add(&string_bytes(item))
    }

    pub fn add_string_front(&self, item: &str) -> io::Result<bool> {
        self.add_front(&string_bytes(item))
    }

    pub fn dispense_string(&self) -> io::Result<Option<String>> {
        Ok(self.dispense()?.map(bytes_to_string))
    }

    pub fn dispense_string_back(&self) -> io::Result<Option<String>> {
        Ok(self.dispense_back()?.map(bytes_to_string))
    }

    pub fn peek_string(&self) -> io::Result<Option<String>> {
        Ok(self.peek()?.map(bytes_to_string))
    }

    pub fn peek_string_back(&self) -> io::Result<Option<String>> {
        Ok(self.peek_back()?.map(bytes_to_string))
    }

    /// Whether the dispenser holds no items. An unset dispenser reads as
    /// empty.
    pub fn is_empty(&self) -> io::Result<bool> {
        if self.shm.is_none() {
            return Ok(true);
        }
        let mutex = self.mutex.as_ref().unwrap();
        mutex.lock()?;
        let empty = self.read_header().count == 0;
        mutex.unlock()?;
        Ok(empty)
    }

    /// Whether the dispenser is at capacity. An unset dispenser reads as
    /// full.
    pub fn is_full(&self) -> io::Result<bool> {
        if self.shm.is_none() {
            return Ok(true);
        }
        let mutex = self.mutex.as_ref().unwrap();
        mutex.lock()?;
        let header = self.read_header();
        let full = header.count == header.capacity;
        mutex.unlock()?;
        Ok(full)
    }

    /// Reset the ring to empty and restore the semaphore accounting: the
    /// not-empty credits of the discarded items are drained and a full set
    /// of capacity credits goes back into not-full.
    pub fn clear(&self) -> io::Result<()> {
        if self.shm.is_none() {
            return Ok(());
        }
        let mutex = self.mutex.as_ref().unwrap();
        mutex.lock()?;
        let mut header = self.read_header();
        let old_count = header.count;
        let capacity = header.capacity;
        header.head = 0;
        header.tail = 0;
        header.count = 0;
        self.write_header(&header);
        mutex.unlock()?;

        let not_empty = self.not_empty.as_ref().unwrap();
        for _ in 0..old_count {
            let _ = not_empty.try_wait()?;
        }
        self.not_full.as_ref().unwrap().post(capacity as u32)?;
        debug!("dispenser '{}' cleared ({old_count} items dropped)", self.id);
        Ok(())
    }

    /// Release this process's handles. The region object itself persists for
    /// as long as any process keeps a handle; it is never deleted here.
    pub fn close(&mut self) {
        self.not_full = None;
        self.not_empty = None;
        self.mutex = None;
        self.shm = None;
    }

    /// Remove every named object backing the dispenser `id`. For tests and
    /// cleanup tooling; live peers lose their rendezvous.
    pub fn clear_storage(id: &str) {
        ShmHandle::clear_storage(&Self::region_name(id));
        IpcMutex::clear_storage(&Self::mutex_name(id));
        IpcSemaphore::clear_storage(&Self::not_empty_name(id));
        IpcSemaphore::clear_storage(&Self::not_full_name(id));
    }
}

impl Drop for ShmDispenser {
    fn drop(&mut self) {
        self.close();
    }
}

fn string_bytes(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

fn bytes_to_string(bytes: Vec<u8>) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_packed() {
        // i32 + five usize fields, no padding.
        assert_eq!(
            HEADER_SIZE,
            4 + 5 * std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn region_size_accounts_for_slot_prefix() {
        let size = region_size(3, 8);
        assert_eq!(size, HEADER_SIZE + 3 * (SLOT_PREFIX + 8));
    }

    #[test]
    fn mode_raw_round_trip() {
        for mode in [DispenserMode::Fifo, DispenserMode::Lifo, DispenserMode::Deque] {
            assert_eq!(DispenserMode::from_raw(mode.as_raw()), Some(mode));
        }
        assert_eq!(DispenserMode::from_raw(9), None);
    }
}
