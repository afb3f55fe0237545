// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Duplex named pipe with length-prefixed message framing.
// Windows: one `\\.\pipe\<name>` kernel pipe. POSIX: a FIFO pair.

use std::io;
use std::time::Duration;

use log::debug;

use crate::platform::PlatformPipe;

/// One end of a duplex named pipe carrying discrete messages.
///
/// Each message travels as a u32 LE length followed by that many bytes, so
/// the receiver never has to guess message boundaries on byte streams.
pub struct NamedPipe {
    name: String,
    inner: Option<PlatformPipe>,
}

impl NamedPipe {
    /// Describe a pipe. No OS object is touched until `create` or `connect`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Server side: create the pipe and block until a client connects.
    pub fn create(&mut self) -> io::Result<()> {
        let inner = PlatformPipe::create(&self.name)?;
        debug!("pipe '{}': client connected", self.name);
        self.inner = Some(inner);
        Ok(())
    }

    /// Client side: connect to the server, retrying until `timeout` while
    /// the server is not ready yet.
    pub fn connect(&mut self, timeout: Duration) -> io::Result<()> {
        let inner = PlatformPipe::connect(&self.name, timeout)?;
        debug!("pipe '{}': connected to server", self.name);
        self.inner = Some(inner);
        Ok(())
    }

    fn open_pipe(&self) -> io::Result<&PlatformPipe> {
        self.inner
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe not open"))
    }

    /// Send one framed message.
    pub fn send_message(&self, data: &[u8]) -> io::Result<()> {
        let pipe = self.open_pipe()?;
        let len = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
        pipe.write_all(&len.to_le_bytes())?;
        pipe.write_all(data)
    }

    /// Send a string message (no trailing NUL; the frame carries the length).
    pub fn send_string(&self, message: &str) -> io::Result<()> {
        self.send_message(message.as_bytes())
    }

    /// Receive one framed message. `Ok(None)` when the peer closed the pipe.
    pub fn receive_message(&self) -> io::Result<Option<Vec<u8>>> {
        let pipe = self.open_pipe()?;
        let mut len_bytes = [0u8; 4];
        if !pipe.read_exact(&mut len_bytes)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut buf = vec![0u8; len];
        if len > 0 && !pipe.read_exact(&mut buf)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed mid-message",
            ));
        }
        Ok(Some(buf))
    }

    /// Receive one message as a string.
    pub fn receive_string(&self) -> io::Result<Option<String>> {
        Ok(self
            .receive_message()?
            .map(|buf| String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Drop the OS handles. The server side also removes its FIFOs on POSIX.
    pub fn close(&mut self) {
        self.inner = None;
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        self.close();
    }
}
