//! In-memory log buffer
//!
//! env_logger writes through a [`TeeWriter`], which forwards every record to
//! stderr and keeps a copy here for the `logs` control request. The buffer
//! is bounded; the oldest whole lines are dropped first.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default buffer size in bytes
pub const DEFAULT_LOG_CAPACITY: usize = 256 * 1024;

/// Shared handle to the captured log text
#[derive(Debug, Clone)]
pub struct LogBuffer {
    text: Arc<Mutex<String>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            text: Arc::new(Mutex::new(String::new())),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        // A panic while appending leaves valid UTF-8 behind
        self.text.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, chunk: &str) {
        let mut text = self.lock();
        text.push_str(chunk);

        if text.len() <= self.capacity {
            return;
        }

        let mut cut = text.len() - self.capacity;
        while !text.is_char_boundary(cut) {
            cut += 1;
        }
        match text[cut..].find('\n') {
            Some(newline) => {
                text.drain(..cut + newline + 1);
            }
            None => text.clear(),
        }
    }

    pub fn contents(&self) -> String {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Writer for `env_logger::Target::Pipe`
    pub fn writer(&self) -> TeeWriter {
        TeeWriter {
            buffer: self.clone(),
        }
    }
}

/// Writes to stderr and into a [`LogBuffer`]
pub struct TeeWriter {
    buffer: LogBuffer,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.buffer.append(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}
