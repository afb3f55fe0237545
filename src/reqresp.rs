// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request-response over named pipes: one listener thread per served id runs
// a receive → handler → reply loop; clients issue synchronous round trips.
// Pipe name grammar: `reqresp_<id>`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::pipe::NamedPipe;

/// Bound on waiting for listener threads to exit during close.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a client keeps retrying to reach a server that is still
/// starting up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server callback: maps a request string to the reply sent back.
pub type RequestHandler = Box<dyn FnMut(&str) -> String + Send>;

fn pipe_name(id: &str) -> String {
    format!("reqresp_{id}")
}

/// Request-response endpoints, keyed by id. One instance can serve several
/// ids and hold client connections to several others at once.
pub struct ReqResp {
    running: Arc<AtomicBool>,
    served: Vec<String>,
    listeners: Vec<thread::JoinHandle<()>>,
    clients: HashMap<String, NamedPipe>,
}

impl ReqResp {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            served: Vec::new(),
            listeners: Vec::new(),
            clients: HashMap::new(),
        }
    }

    /// Start serving `id`: spawns a listener thread that accepts one client
    /// at a time and answers every request through `handler` until close.
    pub fn respond<F>(&mut self, id: &str, handler: F) -> io::Result<()>
    where
        F: FnMut(&str) -> String + Send + 'static,
    {
        if self.served.iter().any(|s| s == id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("already serving id '{id}'"),
            ));
        }

        let running = Arc::clone(&self.running);
        let pipe_id = pipe_name(id);
        let thread_id = id.to_string();
        let mut handler: RequestHandler = Box::new(handler);

        let handle = thread::Builder::new()
            .name(format!("reqresp-{id}"))
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    let mut pipe = NamedPipe::new(&pipe_id);
                    if let Err(e) = pipe.create() {
                        warn!("reqresp '{thread_id}': accept failed: {e}");
                        thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                    debug!("reqresp '{thread_id}': client connected");

                    while running.load(Ordering::Acquire) {
                        let request = match pipe.receive_string() {
                            Ok(Some(req)) => req,
                            Ok(None) => {
                                debug!("reqresp '{thread_id}': client disconnected");
                                break;
                            }
                            Err(e) => {
                                warn!("reqresp '{thread_id}': receive failed: {e}");
                                break;
                            }
                        };
                        let response = handler(&request);
                        if let Err(e) = pipe.send_string(&response) {
                            warn!("reqresp '{thread_id}': reply failed: {e}");
                            break;
                        }
                    }
                }
            })?;

        self.served.push(id.to_string());
        self.listeners.push(handle);
        Ok(())
    }

    /// Connect to the server for `id`.
    pub fn setup_client(&mut self, id: &str) -> io::Result<()> {
        let mut pipe = NamedPipe::new(&pipe_name(id));
        pipe.connect(CONNECT_TIMEOUT)?;
        self.clients.insert(id.to_string(), pipe);
        Ok(())
    }

    /// Send `message` to the server for `id` and wait for its reply.
    /// `Ok(None)` when the server closed the connection.
    pub fn request(&mut self, id: &str, message: &str) -> io::Result<Option<String>> {
        let pipe = self.clients.get(id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no client connection for id '{id}'"),
            )
        })?;
        pipe.send_string(message)?;
        pipe.receive_string()
    }

    /// Stop the listeners (bounded join) and drop every connection.
    ///
    /// A listener parked in accept keeps waiting for a client; it is
    /// detached after the join bound and exits on its next wakeup.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        self.clients.clear();

        let deadline = Instant::now() + JOIN_TIMEOUT;
        for handle in self.listeners.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("reqresp: listener did not stop within {JOIN_TIMEOUT:?}; detaching");
            }
        }
        self.served.clear();
    }
}

impl Default for ReqResp {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReqResp {
    fn drop(&mut self) {
        self.close();
    }
}
