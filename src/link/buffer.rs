//! Peekable accumulation buffer for inbound link bytes.
//!
//! Uses `bytes::BytesMut` so consumed protocol units are split off without
//! copying. Handlers inspect the buffered bytes through [`LinkBuffer::peek`]
//! and only advance the read position when they take a complete unit.
//!
//! The buffer also tracks how long its current contents have been waiting
//! for completion, so the read loop can drop a torn unit instead of waiting
//! for it forever.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

/// Default initial capacity. OBEX frames from the module rarely exceed a few KB.
const DEFAULT_CAPACITY: usize = 8 * 1024;

/// Buffer of bytes read from the link but not yet consumed by a handler.
#[derive(Debug)]
pub struct LinkBuffer {
    buffer: BytesMut,
    /// Set while the buffer holds bytes that no handler has been able to
    /// finish yet.
    waiting_since: Option<Instant>,
}

impl LinkBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            waiting_since: None,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// View the buffered bytes without consuming them.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buffer
    }

    /// Discard `n` bytes from the front.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.buffer.len());
        let _ = self.buffer.split_to(n);
    }

    /// Take `n` bytes from the front as an owned unit.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buffer.len());
        self.buffer.split_to(n).freeze()
    }

    /// Take everything currently buffered.
    pub fn take_all(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and the waiting state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.waiting_since = None;
    }

    /// Record the outcome of a drain pass.
    ///
    /// Progress restarts the stall clock; an untouched remainder keeps the
    /// clock that is already running.
    pub fn note_drained(&mut self, progressed: bool, now: Instant) {
        if self.buffer.is_empty() {
            self.waiting_since = None;
        } else if progressed || self.waiting_since.is_none() {
            self.waiting_since = Some(now);
        }
    }

    /// Instant at which the buffered remainder counts as stalled.
    pub fn stall_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.waiting_since.map(|since| since + timeout)
    }
}

impl Default for LinkBuffer {
    fn default() -> Self {
        Self::new()
    }
}
