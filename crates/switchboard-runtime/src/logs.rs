//! Bounded ring buffer for one child stream (stdout or stderr).
//!
//! Single-writer (the stream-reader task spawned in [`crate::process`]),
//! many-reader through a `Mutex<VecDeque<u8>>` snapshot: each sink keeps
//! only the last N bytes.

use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_CAPACITY_BYTES: usize = 64 * 1024;

pub struct LogRing {
    capacity: usize,
    buf: Mutex<VecDeque<u8>>,
}

impl LogRing {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    /// Append a chunk, evicting from the front until the ring is back
    /// within capacity.
    pub fn push(&self, chunk: &[u8]) {
        let mut buf = self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buf.extend(chunk.iter().copied());
        let overflow = buf.len().saturating_sub(self.capacity);
        if overflow > 0 {
            buf.drain(..overflow);
        }
    }

    /// Snapshot the current contents as a lossy UTF-8 string.
    #[must_use]
    pub fn snapshot(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        String::from_utf8_lossy(&buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_empty()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new()
    }
}
