// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Versioned key→bytes store serialized wholesale into one SharedRegion.
// Cross-process exclusion comes from a named mutex; every public operation
// is a bounded-wait critical section.
//
// Region layout (all integers u32 little-endian, starting at offset 0):
//
//   version | count | { key_len | key (NUL-terminated) | val_len | value }*
//
// `key_len` includes the trailing NUL.

use std::io;

use log::{debug, warn};

use crate::mutex::IpcMutex;
use crate::region::SharedRegion;

/// Bounded wait for the cross-process critical section.
const MUTEX_TIMEOUT_MS: u64 = 5_000;

/// One key→value record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// A shared key→bytes mapping named by its region id.
///
/// Every process attaching to the same id sees the same table: reads reload
/// the serialization from the region, writes re-serialize the whole table
/// back. The named mutex `StoreDictPattern_Mutex_<id>` serializes both
/// against every other cooperating process.
pub struct StoreDict {
    region: SharedRegion,
    entries: Vec<DictEntry>,
    version: u32,
    mutex: IpcMutex,
}

impl StoreDict {
    /// Describe a store named `id` over a region of `size` bytes and open
    /// its named mutex. The region is not touched until
    /// [`setup`](StoreDict::setup).
    pub fn new(id: &str, size: usize) -> io::Result<Self> {
        let region = SharedRegion::new(id, size);
        let mutex = IpcMutex::open(&format!("StoreDictPattern_Mutex_{id}"))?;
        Ok(Self {
            region,
            entries: Vec::new(),
            version: 0,
            mutex,
        })
    }

    /// Map the region and load any existing serialization. A store that does
    /// not exist yet comes up with an empty table.
    ///
    /// Returns `Ok(false)` when the cross-process mutex could not be taken
    /// within the 5 s bound.
    pub fn setup(&mut self) -> io::Result<bool> {
        self.region.setup()?;
        self.locked(|s| {
            s.load_unlocked();
            Ok(())
        })
        .map(|r| r.is_some())
    }

    /// Insert or overwrite `key`. Returns `Ok(false)` when the new
    /// serialization would not fit the region (nothing is changed then) or
    /// when the mutex wait timed out.
    pub fn store(&mut self, key: &str, value: &[u8]) -> io::Result<bool> {
        let outcome = self.locked(|s| {
            s.load_unlocked();

            let extra = match s.entries.iter().position(|e| e.key == key) {
                Some(i) => {
                    entry_size(key, value) as isize - entry_size(key, &s.entries[i].value) as isize
                }
                None => entry_size(key, value) as isize,
            };
            let needed = (serialized_size(&s.entries) as isize + extra) as usize;
            if needed > s.region.size() {
                warn!(
                    "store '{}': serialization of {needed} bytes exceeds region size {}",
                    s.region.id(),
                    s.region.size()
                );
                return Ok(false);
            }

            match s.entries.iter().position(|e| e.key == key) {
                Some(i) => s.entries[i].value = value.to_vec(),
                None => s.entries.push(DictEntry {
                    key: key.to_string(),
                    value: value.to_vec(),
                }),
            }
            s.sync_unlocked()
        })?;
        Ok(outcome.unwrap_or(false))
    }

    /// Store a string value. The stored bytes include a trailing NUL so the
    /// value reads back as a C string too.
    pub fn store_string(&mut self, key: &str, value: &str) -> io::Result<bool> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.store(key, &bytes)
    }

    /// Alias for [`store`](StoreDict::store).
    pub fn store_bytes(&mut self, key: &str, value: &[u8]) -> io::Result<bool> {
        self.store(key, value)
    }

    /// Owned copy of the value under `key`, reloaded from the region first so
    /// other processes' writes are visible. `Ok(None)` on a missing key or a
    /// mutex timeout.
    pub fn retrieve(&mut self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let outcome = self.locked(|s| {
            s.load_unlocked();
            Ok(s.entries
                .iter()
                .find(|e| e.key == key)
                .map(|e| e.value.clone()))
        })?;
        Ok(outcome.flatten())
    }

    /// [`retrieve`](StoreDict::retrieve), interpreting the value as a
    /// NUL-terminated string.
    pub fn retrieve_string(&mut self, key: &str) -> io::Result<Option<String>> {
        Ok(self.retrieve(key)?.map(|v| {
            let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
            String::from_utf8_lossy(&v[..end]).into_owned()
        }))
    }

    /// Remove `key` and re-serialize. Returns `Ok(false)` when the key was
    /// absent or the mutex wait timed out.
    pub fn delete(&mut self, key: &str) -> io::Result<bool> {
        let outcome = self.locked(|s| {
            s.load_unlocked();
            match s.entries.iter().position(|e| e.key == key) {
                Some(i) => {
                    s.entries.remove(i);
                    s.sync_unlocked()
                }
                None => {
                    debug!("store '{}': key '{key}' not found", s.region.id());
                    Ok(false)
                }
            }
        })?;
        Ok(outcome.unwrap_or(false))
    }

    /// Drop every entry and write the empty table back.
    pub fn clear(&mut self) -> io::Result<bool> {
        let outcome = self.locked(|s| {
            s.entries.clear();
            s.sync_unlocked()
        })?;
        Ok(outcome.unwrap_or(false))
    }

    /// Snapshot of all keys, in insertion order.
    pub fn list_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Number of entries in the in-memory table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The version counter as of the most recent load or sync.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Reparse the region into the in-memory table, replacing it wholesale.
    pub fn load(&mut self) {
        self.load_unlocked();
    }

    /// Serialize the current table to the region under the mutex.
    /// `Ok(false)` when it does not fit or the mutex wait timed out.
    pub fn sync(&mut self) -> io::Result<bool> {
        let outcome = self.locked(|s| s.sync_unlocked())?;
        Ok(outcome.unwrap_or(false))
    }

    /// Close the underlying region. The named mutex is released with the
    /// value itself.
    pub fn close(&mut self) {
        self.region.close();
    }

    /// Close and delete the backing file.
    pub fn unlink(&mut self) -> io::Result<()> {
        self.region.unlink()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    /// Run `f` under the named mutex. `Ok(None)` when the 5 s bound expires.
    fn locked<T>(&mut self, f: impl FnOnce(&mut Self) -> io::Result<T>) -> io::Result<Option<T>> {
        if !self.mutex.lock_timeout(MUTEX_TIMEOUT_MS)? {
            warn!("store '{}': mutex wait timed out", self.region.id());
            return Ok(None);
        }
        let result = f(self);
        if let Err(e) = self.mutex.unlock() {
            warn!("store '{}': mutex unlock failed: {e}", self.region.id());
        }
        result.map(Some)
    }

    fn load_unlocked(&mut self) {
        let data = match self.region.read() {
            Ok(d) => d,
            Err(e) => {
                debug!("store '{}': load skipped: {e}", self.region.id());
                return;
            }
        };
        let (version, entries) = parse(&data);
        self.version = version;
        self.entries = entries;
    }

    fn sync_unlocked(&mut self) -> io::Result<bool> {
        let needed = serialized_size(&self.entries);
        if needed > self.region.size() {
            warn!(
                "store '{}': serialization of {needed} bytes exceeds region size {}",
                self.region.id(),
                self.region.size()
            );
            return Ok(false);
        }
        self.version = self.version.wrapping_add(1);
        let buf = serialize(self.version, &self.entries);
        self.region.write(&buf)?;
        debug!(
            "store '{}': synced {} entries, version {}",
            self.region.id(),
            self.entries.len(),
            self.version
        );
        Ok(true)
    }
}

impl Drop for StoreDict {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Serialization codec
// ---------------------------------------------------------------------------

/// Bytes one entry occupies on the region.
fn entry_size(key: &str, value: &[u8]) -> usize {
    4 + key.len() + 1 + 4 + value.len()
}

/// Total serialized size of `entries` including the version and count words.
pub(crate) fn serialized_size(entries: &[DictEntry]) -> usize {
    8 + entries
        .iter()
        .map(|e| entry_size(&e.key, &e.value))
        .sum::<usize>()
}

/// Serialize `entries` with `version` as the leading word.
pub(crate) fn serialize(version: u32, entries: &[DictEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(serialized_size(entries));
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        let key_len = e.key.len() as u32 + 1;
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(e.key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&(e.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&e.value);
    }
    buf
}

/// Parse a region image. Truncated or inconsistent records terminate the
/// parse; everything decoded up to that point is kept.
pub(crate) fn parse(data: &[u8]) -> (u32, Vec<DictEntry>) {
    let mut entries = Vec::new();
    if data.len() < 8 {
        return (0, entries);
    }
    let version = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    let mut pos = 8usize;

    for _ in 0..count {
        let Some(key_len) = read_u32(data, &mut pos) else {
            break;
        };
        let key_len = key_len as usize;
        if key_len == 0 || pos + key_len > data.len() {
            break;
        }
        let key_bytes = &data[pos..pos + key_len - 1]; // strip the NUL
        pos += key_len;

        let Some(val_len) = read_u32(data, &mut pos) else {
            break;
        };
        let val_len = val_len as usize;
        if pos + val_len > data.len() {
            break;
        }
        let value = data[pos..pos + val_len].to_vec();
        pos += val_len;

        entries.push(DictEntry {
            key: String::from_utf8_lossy(key_bytes).into_owned(),
            value,
        });
    }

    (version, entries)
}

fn read_u32(data: &[u8], pos: &mut usize) -> Option<u32> {
    if *pos + 4 > data.len() {
        return None;
    }
    let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<DictEntry> {
        vec![
            DictEntry {
                key: "greeting".into(),
                value: b"Hello\0".to_vec(),
            },
            DictEntry {
                key: "number".into(),
                value: b"12345\0".to_vec(),
            },
        ]
    }

    #[test]
    fn serialize_layout_is_bit_exact() {
        let entries = vec![DictEntry {
            key: "k".into(),
            value: vec![0xAA, 0xBB],
        }];
        let buf = serialize(7, &entries);
        // version | count | key_len(2) | "k\0" | val_len(2) | value
        assert_eq!(
            buf,
            [
                7, 0, 0, 0, //
                1, 0, 0, 0, //
                2, 0, 0, 0, //
                b'k', 0, //
                2, 0, 0, 0, //
                0xAA, 0xBB,
            ]
        );
    }

    #[test]
    fn parse_round_trip() {
        let entries = sample();
        let buf = serialize(42, &entries);
        let (version, parsed) = parse(&buf);
        assert_eq!(version, 42);
        assert_eq!(parsed, entries);
    }

    #[test]
    fn serialized_size_matches_serialize() {
        let entries = sample();
        assert_eq!(serialized_size(&entries), serialize(1, &entries).len());
    }

    #[test]
    fn parse_zeroed_region_is_empty() {
        let (version, entries) = parse(&[0u8; 256]);
        assert_eq!(version, 0);
        assert!(entries.is_empty());
    }

    #[test]
    fn parse_tolerates_truncation() {
        let entries = sample();
        let buf = serialize(3, &entries);
        // Cut into the middle of the second entry: only the first survives.
        let (version, parsed) = parse(&buf[..buf.len() - 4]);
        assert_eq!(version, 3);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key, "greeting");
    }

    #[test]
    fn parse_rejects_absurd_lengths() {
        let mut buf = serialize(1, &sample());
        // Corrupt the first key_len into something past the buffer end.
        buf[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        let (_, parsed) = parse(&buf);
        assert!(parsed.is_empty());
    }

    #[test]
    fn parse_short_input() {
        assert_eq!(parse(&[]).1.len(), 0);
        assert_eq!(parse(&[1, 2, 3]).1.len(), 0);
    }
}
