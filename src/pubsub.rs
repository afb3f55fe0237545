// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Topic-based publish/subscribe over a StoreDict: a topic is a key, its
// value is the latest framed message. Subscribers are served by one
// background poller per PubSub instance.
//
// Message framing (little-endian): u32 msg_id | u32 payload_size | payload.
//
// This is a latest-value broadcast, not a queue: publishing overwrites the
// previous message for the topic, so a publisher running faster than the
// 100 ms poll period will cause subscribers to miss intermediate ids.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::store_dict::StoreDict;

/// Poll period of the background delivery loop.
const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Bound on waiting for the poller to exit during close.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Seen-id cache bound per topic; once exceeded the oldest half is evicted.
const SEEN_IDS_MAX: usize = 1000;
const SEEN_IDS_KEEP: usize = 500;

/// Subscriber callback: `(topic, payload)`. Runs on the poller thread.
pub type MessageHandler = Box<dyn FnMut(&str, &[u8]) + Send>;

#[derive(Default)]
struct TopicState {
    subscribers: Vec<MessageHandler>,
    seen_ids: Vec<u32>,
}

impl TopicState {
    fn has_seen(&self, msg_id: u32) -> bool {
        self.seen_ids.contains(&msg_id)
    }

    fn mark_seen(&mut self, msg_id: u32) {
        self.seen_ids.push(msg_id);
        if self.seen_ids.len() > SEEN_IDS_MAX {
            let excess = self.seen_ids.len() - SEEN_IDS_KEEP;
            self.seen_ids.drain(..excess);
        }
    }
}

struct PubSubInner {
    name: String,
    store: Mutex<StoreDict>,
    topics: Mutex<HashMap<String, TopicState>>,
    message_counter: AtomicU32,
    running: AtomicBool,
}

/// Publish/subscribe system over the StoreDict named `name`.
pub struct PubSub {
    inner: Arc<PubSubInner>,
    poller: Option<thread::JoinHandle<()>>,
}

impl PubSub {
    /// Describe a pub/sub system whose topics live in a StoreDict named
    /// `name` over a region of `size` bytes.
    pub fn new(name: &str, size: usize) -> io::Result<Self> {
        let store = StoreDict::new(name, size)?;
        Ok(Self {
            inner: Arc::new(PubSubInner {
                name: name.to_string(),
                store: Mutex::new(store),
                topics: Mutex::new(HashMap::new()),
                message_counter: AtomicU32::new(0),
                running: AtomicBool::new(false),
            }),
            poller: None,
        })
    }

    /// Set up the underlying store and start the background poller.
    pub fn setup(&mut self) -> io::Result<()> {
        self.inner.store.lock().unwrap().setup()?;

        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let poller = thread::Builder::new()
            .name(format!("pubsub-poll-{}", self.inner.name))
            .spawn(move || {
                while inner.running.load(Ordering::Acquire) {
                    poll_tick(&inner);
                    thread::sleep(POLL_PERIOD);
                }
            });
        match poller {
            Ok(handle) => {
                self.poller = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Write an initial record for `topic` (msg_id 0, one NUL byte).
    /// Harmless if the topic already exists.
    pub fn create_topic(&self, topic: &str) -> io::Result<bool> {
        let framed = pack_message(0, &[0u8]);
        self.inner.store.lock().unwrap().store(topic, &framed)
    }

    /// Publish a payload to `topic`, overwriting any previous message.
    /// Returns `Ok(false)` when the store rejected the write.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> io::Result<bool> {
        let msg_id = self
            .inner
            .message_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let framed = pack_message(msg_id, payload);
        let stored = self.inner.store.lock().unwrap().store(topic, &framed)?;
        if stored {
            debug!(
                "pubsub '{}': published id {msg_id} to '{topic}'",
                self.inner.name
            );
        }
        Ok(stored)
    }

    /// Publish a string payload (with trailing NUL, like the store's own
    /// string convention).
    pub fn publish_string(&self, topic: &str, message: &str) -> io::Result<bool> {
        let mut payload = Vec::with_capacity(message.len() + 1);
        payload.extend_from_slice(message.as_bytes());
        payload.push(0);
        self.publish(topic, &payload)
    }

    /// Register `handler` for `topic`. The handler runs on the poller
    /// thread, once per unseen msg_id; it must not subscribe from within
    /// itself.
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: FnMut(&str, &[u8]) + Send + 'static,
    {
        let mut topics = self.inner.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push(Box::new(handler));
        debug!("pubsub '{}': subscribed to '{topic}'", self.inner.name);
    }

    /// Stop the poller (bounded 1 s join) and close the store.
    pub fn close(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.poller.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    "pubsub '{}': poller did not stop within {:?}; detaching",
                    self.inner.name, JOIN_TIMEOUT
                );
            }
        }
        self.inner.store.lock().unwrap().close();
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        self.close();
    }
}

/// One pass of the delivery loop: snapshot every topic's latest record,
/// then hand unseen messages to the subscribers.
fn poll_tick(inner: &PubSubInner) {
    // Phase 1: collect under the store lock only, so handlers are free to
    // publish without deadlocking.
    let mut fetched: Vec<(String, Vec<u8>)> = Vec::new();
    {
        let mut store = inner.store.lock().unwrap();
        store.load();
        for key in store.list_keys() {
            match store.retrieve(&key) {
                Ok(Some(data)) => fetched.push((key, data)),
                Ok(None) => {}
                Err(e) => {
                    debug!("pubsub '{}': retrieve '{key}' failed: {e}", inner.name);
                }
            }
        }
    }

    // Phase 2: deliver.
    let mut topics = inner.topics.lock().unwrap();
    for (key, data) in fetched {
        let Some((msg_id, payload)) = unpack_message(&data) else {
            // Malformed frame: drop the record silently and keep polling.
            continue;
        };
        let topic = topics.entry(key.clone()).or_default();
        if topic.has_seen(msg_id) {
            continue;
        }
        for handler in topic.subscribers.iter_mut() {
            handler(&key, payload);
        }
        topic.mark_seen(msg_id);
        debug!("pubsub '{}': delivered id {msg_id} on '{key}'", inner.name);
    }
}

/// Frame `payload` as `msg_id | payload_size | payload`.
pub(crate) fn pack_message(msg_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&msg_id.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parse a framed message; `None` when the frame is shorter than its header
/// or the declared payload overruns the record.
pub(crate) fn unpack_message(data: &[u8]) -> Option<(u32, &[u8])> {
    if data.len() < 8 {
        return None;
    }
    let msg_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let payload_size = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if 8 + payload_size > data.len() {
        return None;
    }
    Some((msg_id, &data[8..8 + payload_size]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let framed = pack_message(7, b"n=1\0");
        assert_eq!(framed.len(), 12);
        let (id, payload) = unpack_message(&framed).unwrap();
        assert_eq!(id, 7);
        assert_eq!(payload, b"n=1\0");
    }

    #[test]
    fn unpack_rejects_short_frames() {
        assert!(unpack_message(b"").is_none());
        assert!(unpack_message(&[1, 2, 3, 4, 5, 6, 7]).is_none());
    }

    #[test]
    fn unpack_rejects_overrunning_payload() {
        let mut framed = pack_message(1, b"abcd");
        framed[4..8].copy_from_slice(&100u32.to_le_bytes());
        assert!(unpack_message(&framed).is_none());
    }

    #[test]
    fn seen_ids_evict_oldest_half() {
        let mut topic = TopicState::default();
        for id in 0..=SEEN_IDS_MAX as u32 {
            topic.mark_seen(id);
        }
        assert_eq!(topic.seen_ids.len(), SEEN_IDS_KEEP);
        // Most recent ids survive; the oldest are gone.
        assert!(topic.has_seen(SEEN_IDS_MAX as u32));
        assert!(!topic.has_seen(0));
    }
}
