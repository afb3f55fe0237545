// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pipe-backed dispenser: the provider keeps the items in its own memory and
// serves a small command protocol over the named pipe `dispenser_<id>`.
// Unlike the shared-memory dispenser, the items die with the provider.
//
// Protocol (one framed message per command / reply):
//   ADD <item> | ADD_FRONT <item> | DISPENSE | DISPENSE_BACK
//   PEEK | PEEK_BACK | IS_EMPTY | CLEAR
// Replies: OK [<item>] | EMPTY | TRUE | FALSE | ERR <reason>

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::dispenser::DispenserMode;
use crate::pipe::NamedPipe;

const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn pipe_name(id: &str) -> String {
    format!("dispenser_{id}")
}

type Items = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// A dispenser served over a named pipe by its provider process.
///
/// The provider operates on its local deque directly; consumers reach the
/// same deque through the command protocol.
pub struct PipeDispenser {
    id: String,
    mode: DispenserMode,
    items: Items,
    running: Arc<AtomicBool>,
    listener: Option<thread::JoinHandle<()>>,
    client: Option<NamedPipe>,
}

impl PipeDispenser {
    pub fn new(id: &str, mode: DispenserMode) -> Self {
        Self {
            id: id.to_string(),
            mode,
            items: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
            listener: None,
            client: None,
        }
    }

    /// Provider side: start the serving thread. Items live in this process
    /// and survive client reconnects, but not provider shutdown.
    pub fn setup_provider(&mut self) -> io::Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let items = Arc::clone(&self.items);
        let pipe_id = pipe_name(&self.id);
        let id = self.id.clone();
        let mode = self.mode;

        let handle = thread::Builder::new()
            .name(format!("pipe-dispenser-{}", self.id))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    let mut pipe = NamedPipe::new(&pipe_id);
                    if let Err(e) = pipe.create() {
                        warn!("pipe dispenser '{id}': accept failed: {e}");
                        thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                    debug!("pipe dispenser '{id}': consumer connected");
                    serve_client(&pipe, &running, mode, &items, &id);
                }
            })?;
        self.listener = Some(handle);
        Ok(())
    }

    /// Consumer side: connect to the provider.
    pub fn setup_consumer(&mut self) -> io::Result<()> {
        let mut pipe = NamedPipe::new(&pipe_name(&self.id));
        pipe.connect(CONNECT_TIMEOUT)?;
        self.client = Some(pipe);
        Ok(())
    }

    fn is_provider(&self) -> bool {
        self.listener.is_some()
    }

    fn round_trip(&self, command: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let pipe = self.client.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "consumer not connected")
        })?;
        pipe.send_message(command)?;
        pipe.receive_message()
    }

    fn command_with_item(&self, verb: &str, item: &[u8]) -> io::Result<bool> {
        let mut command = Vec::with_capacity(verb.len() + 1 + item.len());
        command.extend_from_slice(verb.as_bytes());
        command.push(b' ');
        command.extend_from_slice(item);
        match self.round_trip(&command)? {
            Some(reply) => Ok(reply == b"OK"),
            None => Ok(false),
        }
    }

    fn command_fetching_item(&self, verb: &str) -> io::Result<Option<Vec<u8>>> {
        match self.round_trip(verb.as_bytes())? {
            Some(reply) if reply.starts_with(b"OK ") => Ok(Some(reply[3..].to_vec())),
            _ => Ok(None),
        }
    }

    fn local(&self, command: Vec<u8>) -> Vec<u8> {
        let mut items = self.items.lock().unwrap();
        execute(&command, self.mode, &mut items)
    }

    fn local_with_item(&self, verb: &str, item: &[u8]) -> bool {
        let mut command = verb.as_bytes().to_vec();
        command.push(b' ');
        command.extend_from_slice(item);
        self.local(command) == b"OK"
    }

    fn local_fetching_item(&self, verb: &str) -> Option<Vec<u8>> {
        let reply = self.local(verb.as_bytes().to_vec());
        reply.strip_prefix(b"OK ").map(|item| item.to_vec())
    }

    /// Add at the back (FIFO/DEQUE) or on top (LIFO).
    pub fn add(&self, item: &[u8]) -> io::Result<bool> {
        if self.is_provider() {
            return Ok(self.local_with_item("ADD", item));
        }
        self.command_with_item("ADD", item)
    }

    /// Add at the front. DEQUE only.
    pub fn add_front(&self, item: &[u8]) -> io::Result<bool> {
        if self.is_provider() {
            return Ok(self.local_with_item("ADD_FRONT", item));
        }
        self.command_with_item("ADD_FRONT", item)
    }

    pub fn add_string(&self, item: &str) -> io::Result<bool> {
        self.add(item.as_bytes())
    }

    pub fn add_string_front(&self, item: &str) -> io::Result<bool> {
        self.add_front(item.as_bytes())
    }

    /// Remove and return the front item; `Ok(None)` when empty.
    pub fn dispense(&self) -> io::Result<Option<Vec<u8>>> {
        if self.is_provider() {
            return Ok(self.local_fetching_item("DISPENSE"));
        }
        self.command_fetching_item("DISPENSE")
    }

    /// Remove and return the back item. DEQUE only.
    pub fn dispense_back(&self) -> io::Result<Option<Vec<u8>>> {
        if self.is_provider() {
            return Ok(self.local_fetching_item("DISPENSE_BACK"));
        }
        self.command_fetching_item("DISPENSE_BACK")
    }

    pub fn dispense_string(&self) -> io::Result<Option<String>> {
        Ok(self
            .dispense()?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub fn dispense_string_back(&self) -> io::Result<Option<String>> {
        Ok(self
            .dispense_back()?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Copy the front item without removing it.
    pub fn peek(&self) -> io::Result<Option<Vec<u8>>> {
        if self.is_provider() {
            return Ok(self.local_fetching_item("PEEK"));
        }
        self.command_fetching_item("PEEK")
    }

    /// Copy the back item without removing it. DEQUE only.
    pub fn peek_back(&self) -> io::Result<Option<Vec<u8>>> {
        if self.is_provider() {
            return Ok(self.local_fetching_item("PEEK_BACK"));
        }
        self.command_fetching_item("PEEK_BACK")
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        if self.is_provider() {
            return Ok(self.local(b"IS_EMPTY".to_vec()) == b"TRUE");
        }
        match self.round_trip(b"IS_EMPTY")? {
            Some(reply) => Ok(reply == b"TRUE"),
            None => Ok(true),
        }
    }

    pub fn clear(&self) -> io::Result<bool> {
        if self.is_provider() {
            return Ok(self.local(b"CLEAR".to_vec()) == b"OK");
        }
        match self.round_trip(b"CLEAR")? {
            Some(reply) => Ok(reply == b"OK"),
            None => Ok(false),
        }
    }

    /// Stop serving / disconnect. Bounded join on the provider thread; a
    /// listener parked in accept is detached and exits on its next wakeup.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        self.client = None;
        if let Some(handle) = self.listener.take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    "pipe dispenser '{}': listener did not stop within {JOIN_TIMEOUT:?}; detaching",
                    self.id
                );
            }
        }
    }
}

impl Drop for PipeDispenser {
    fn drop(&mut self) {
        self.close();
    }
}

/// Answer commands from one connected consumer until it disconnects.
fn serve_client(pipe: &NamedPipe, running: &AtomicBool, mode: DispenserMode, items: &Items, id: &str) {
    while running.load(Ordering::Acquire) {
        let command = match pipe.receive_message() {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                debug!("pipe dispenser '{id}': consumer disconnected");
                return;
            }
            Err(e) => {
                warn!("pipe dispenser '{id}': receive failed: {e}");
                return;
            }
        };

        let reply = {
            let mut items = items.lock().unwrap();
            execute(&command, mode, &mut items)
        };
        if let Err(e) = pipe.send_message(&reply) {
            warn!("pipe dispenser '{id}': reply failed: {e}");
            return;
        }
    }
}

fn execute(command: &[u8], mode: DispenserMode, items: &mut VecDeque<Vec<u8>>) -> Vec<u8> {
    fn ok_with(item: Vec<u8>) -> Vec<u8> {
        let mut reply = b"OK ".to_vec();
        reply.extend_from_slice(&item);
        reply
    }

    if let Some(item) = command.strip_prefix(b"ADD ") {
        match mode {
            DispenserMode::Lifo => items.push_front(item.to_vec()),
            DispenserMode::Fifo | DispenserMode::Deque => items.push_back(item.to_vec()),
        }
        return b"OK".to_vec();
    }
    if let Some(item) = command.strip_prefix(b"ADD_FRONT ") {
        if mode != DispenserMode::Deque {
            return b"ERR add_front requires DEQUE mode".to_vec();
        }
        items.push_front(item.to_vec());
        return b"OK".to_vec();
    }

    match command {
        b"DISPENSE" => match items.pop_front() {
            Some(item) => ok_with(item),
            None => b"EMPTY".to_vec(),
        },
        b"DISPENSE_BACK" => {
            if mode != DispenserMode::Deque {
                return b"ERR dispense_back requires DEQUE mode".to_vec();
            }
            match items.pop_back() {
                Some(item) => ok_with(item),
                None => b"EMPTY".to_vec(),
            }
        }
        b"PEEK" => match items.front() {
            Some(item) => ok_with(item.clone()),
            None => b"EMPTY".to_vec(),
        },
        b"PEEK_BACK" => {
            if mode != DispenserMode::Deque {
                return b"ERR peek_back requires DEQUE mode".to_vec();
            }
            match items.back() {
                Some(item) => ok_with(item.clone()),
                None => b"EMPTY".to_vec(),
            }
        }
        b"IS_EMPTY" => {
            if items.is_empty() {
                b"TRUE".to_vec()
            } else {
                b"FALSE".to_vec()
            }
        }
        b"CLEAR" => {
            items.clear();
            b"OK".to_vec()
        }
        _ => b"ERR unknown command".to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_protocol_order() {
        let mut items = VecDeque::new();
        assert_eq!(execute(b"ADD a", DispenserMode::Fifo, &mut items), b"OK");
        assert_eq!(execute(b"ADD b", DispenserMode::Fifo, &mut items), b"OK");
        assert_eq!(execute(b"DISPENSE", DispenserMode::Fifo, &mut items), b"OK a");
        assert_eq!(execute(b"DISPENSE", DispenserMode::Fifo, &mut items), b"OK b");
        assert_eq!(execute(b"DISPENSE", DispenserMode::Fifo, &mut items), b"EMPTY");
    }

    #[test]
    fn lifo_protocol_order() {
        let mut items = VecDeque::new();
        execute(b"ADD x", DispenserMode::Lifo, &mut items);
        execute(b"ADD y", DispenserMode::Lifo, &mut items);
        assert_eq!(execute(b"DISPENSE", DispenserMode::Lifo, &mut items), b"OK y");
        assert_eq!(execute(b"DISPENSE", DispenserMode::Lifo, &mut items), b"OK x");
    }

    #[test]
    fn deque_mode_violations() {
        let mut items = VecDeque::new();
        let reply = execute(b"ADD_FRONT z", DispenserMode::Fifo, &mut items);
        assert!(reply.starts_with(b"ERR"));
        let reply = execute(b"DISPENSE_BACK", DispenserMode::Lifo, &mut items);
        assert!(reply.starts_with(b"ERR"));
    }

    #[test]
    fn deque_both_ends() {
        let mut items = VecDeque::new();
        execute(b"ADD 1", DispenserMode::Deque, &mut items);
        execute(b"ADD 2", DispenserMode::Deque, &mut items);
        execute(b"ADD_FRONT 0", DispenserMode::Deque, &mut items);
        assert_eq!(
            execute(b"DISPENSE_BACK", DispenserMode::Deque, &mut items),
            b"OK 2"
        );
        assert_eq!(execute(b"DISPENSE", DispenserMode::Deque, &mut items), b"OK 0");
    }

    #[test]
    fn is_empty_and_clear() {
        let mut items = VecDeque::new();
        assert_eq!(execute(b"IS_EMPTY", DispenserMode::Fifo, &mut items), b"TRUE");
        execute(b"ADD a", DispenserMode::Fifo, &mut items);
        assert_eq!(execute(b"IS_EMPTY", DispenserMode::Fifo, &mut items), b"FALSE");
        assert_eq!(execute(b"CLEAR", DispenserMode::Fifo, &mut items), b"OK");
        assert_eq!(execute(b"IS_EMPTY", DispenserMode::Fifo, &mut items), b"TRUE");
    }

    #[test]
    fn unknown_command() {
        let mut items = VecDeque::new();
        assert!(execute(b"NOPE", DispenserMode::Fifo, &mut items).starts_with(b"ERR"));
    }
}
