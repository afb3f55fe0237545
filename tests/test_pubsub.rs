// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// PubSub tests: deliver-once semantics, topic creation, publisher and
// subscriber in separate instances sharing one store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossipc::{IpcMutex, PubSub};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_pubsub_{n}")
}

fn scrub(name: &str) {
    let _ = std::fs::remove_file(std::env::temp_dir().join(format!("{name}.bin")));
    IpcMutex::clear_storage(&format!("StoreDictPattern_Mutex_{name}"));
}

/// Spin until `pred` holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}

#[test]
fn subscriber_receives_each_message_once() {
    let name = unique_name("deliver_once");
    scrub(&name);

    let mut publisher = PubSub::new(&name, 4096).expect("publisher");
    publisher.setup().expect("setup publisher");

    let mut subscriber = PubSub::new(&name, 4096).expect("subscriber");
    subscriber.setup().expect("setup subscriber");

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    subscriber.subscribe("news", move |_topic, payload| {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        sink.lock()
            .unwrap()
            .push(String::from_utf8_lossy(&payload[..end]).into_owned());
    });

    assert!(publisher.publish_string("news", "n=1").expect("publish"));
    assert!(wait_until(Duration::from_secs(2), || {
        received.lock().unwrap().len() == 1
    }));

    assert!(publisher.publish_string("news", "n=2").expect("publish"));
    assert!(wait_until(Duration::from_secs(2), || {
        received.lock().unwrap().len() == 2
    }));

    // Several more poll periods must not re-deliver either message.
    std::thread::sleep(Duration::from_millis(350));
    assert_eq!(*received.lock().unwrap(), vec!["n=1", "n=2"]);

    subscriber.close();
    publisher.close();
}

#[test]
fn every_subscriber_sees_the_message() {
    let name = unique_name("fanout");
    scrub(&name);

    let mut pubsub = PubSub::new(&name, 4096).expect("pubsub");
    pubsub.setup().expect("setup");

    let hits = Arc::new(Mutex::new([0usize; 2]));
    for slot in 0..2 {
        let hits = Arc::clone(&hits);
        pubsub.subscribe("fan", move |_topic, _payload| {
            hits.lock().unwrap()[slot] += 1;
        });
    }

    assert!(pubsub.publish_string("fan", "one for all").unwrap());
    assert!(wait_until(Duration::from_secs(2), || {
        *hits.lock().unwrap() == [1, 1]
    }));

    pubsub.close();
}

#[test]
fn create_topic_is_idempotent_and_delivered_once() {
    let name = unique_name("create_topic");
    scrub(&name);

    let mut pubsub = PubSub::new(&name, 4096).expect("pubsub");
    pubsub.setup().expect("setup");

    let count = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count);
    pubsub.subscribe("announcements", move |_topic, payload| {
        assert_eq!(payload, &[0u8][..]);
        *sink.lock().unwrap() += 1;
    });

    assert!(pubsub.create_topic("announcements").expect("create"));
    assert!(pubsub.create_topic("announcements").expect("create again"));

    // The initial record has msg_id 0; repeating it must not re-deliver.
    assert!(wait_until(Duration::from_secs(2), || *count.lock().unwrap() == 1));
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(*count.lock().unwrap(), 1);

    pubsub.close();
}

#[test]
fn unsubscribed_topics_are_ignored() {
    let name = unique_name("other_topic");
    scrub(&name);

    let mut pubsub = PubSub::new(&name, 4096).expect("pubsub");
    pubsub.setup().expect("setup");

    let hits = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&hits);
    pubsub.subscribe("mine", move |_topic, _payload| {
        *sink.lock().unwrap() += 1;
    });

    assert!(pubsub.publish_string("theirs", "not for us").unwrap());
    assert!(pubsub.publish_string("mine", "for us").unwrap());

    assert!(wait_until(Duration::from_secs(2), || *hits.lock().unwrap() == 1));
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(*hits.lock().unwrap(), 1);

    pubsub.close();
}

#[test]
fn latest_value_wins_within_one_poll_window() {
    let name = unique_name("overwrite");
    scrub(&name);

    let mut publisher = PubSub::new(&name, 4096).expect("publisher");
    publisher.setup().expect("setup");

    let mut subscriber = PubSub::new(&name, 4096).expect("subscriber");
    subscriber.setup().expect("setup");

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    subscriber.subscribe("burst", move |_topic, payload| {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        sink.lock()
            .unwrap()
            .push(String::from_utf8_lossy(&payload[..end]).into_owned());
    });

    // Burst faster than the poller: the store keeps only the last message.
    for i in 0..5 {
        assert!(publisher.publish_string("burst", &format!("m{i}")).unwrap());
    }

    assert!(wait_until(Duration::from_secs(2), || {
        received.lock().unwrap().iter().any(|m| m == "m4")
    }));
    std::thread::sleep(Duration::from_millis(250));

    let received = received.lock().unwrap();
    assert!(received.contains(&"m4".to_string()), "latest message must arrive");
    // Deliver-once still holds for whatever subset survived the overwrites.
    let mut sorted = received.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), received.len(), "duplicate delivery observed");

    subscriber.close();
    publisher.close();
}

#[test]
fn close_stops_the_poller() {
    let name = unique_name("close");
    scrub(&name);

    let mut pubsub = PubSub::new(&name, 4096).expect("pubsub");
    pubsub.setup().expect("setup");

    let hits = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&hits);
    pubsub.subscribe("quiet", move |_topic, _payload| {
        *sink.lock().unwrap() += 1;
    });
    pubsub.close();

    // Publishing through a fresh instance after close must not reach the
    // closed subscriber.
    let mut other = PubSub::new(&name, 4096).expect("other");
    other.setup().expect("setup");
    assert!(other.publish_string("quiet", "anyone there?").unwrap());
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*hits.lock().unwrap(), 0);
    other.close();
}
