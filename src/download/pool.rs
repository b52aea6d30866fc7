/*!
 * Bounded pool of reusable chunk buffers
 *
 * The pool is the only throttle on a download session: a worker must take a
 * buffer before it may claim a chunk, and a buffer comes back only once the
 * consumer has drained it. With `capacity` buffers in circulation at most
 * `capacity` chunks are in flight or waiting to be read.
 */

use crate::util::lock;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// One chunk's worth of bytes plus a read cursor
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl ChunkBuffer {
    /// Bytes held
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear contents and cursor, keeping the allocation
    pub fn reset(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    pub(crate) fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Unread part of the buffer
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Copy as much of the unread part as fits into `out`
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.remaining().len().min(out.len());
        out[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    /// Mark `n` unread bytes as consumed
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    /// True once every byte has been read
    pub fn is_drained(&self) -> bool {
        self.pos >= self.data.len()
    }
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<ChunkBuffer>,
    closed: bool,
    checked_out: usize,
    peak_checked_out: usize,
}

/// Fixed-capacity pool of [`ChunkBuffer`]s
#[derive(Debug)]
pub struct ChunkBufferPool {
    capacity: usize,
    state: Mutex<PoolState>,
    available: Notify,
}

impl ChunkBufferPool {
    /// Create a pool holding `capacity` empty buffers
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| ChunkBuffer::default()).collect();
        Self {
            capacity,
            state: Mutex::new(PoolState {
                free,
                ..Default::default()
            }),
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free buffer.
    ///
    /// Returns `None` once the pool is closed, including for callers already
    /// waiting when it closes.
    pub async fn take(&self) -> Option<ChunkBuffer> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.state);
                if state.closed {
                    return None;
                }
                if let Some(buffer) = state.free.pop_front() {
                    state.checked_out += 1;
                    state.peak_checked_out = state.peak_checked_out.max(state.checked_out);
                    return Some(buffer);
                }
            }

            notified.await;
        }
    }

    /// Return a buffer. After `close` the buffer is dropped instead.
    pub fn put(&self, mut buffer: ChunkBuffer) {
        let mut state = lock(&self.state);
        state.checked_out = state.checked_out.saturating_sub(1);
        if state.closed {
            return;
        }
        buffer.reset();
        state.free.push_back(buffer);
        drop(state);
        self.available.notify_one();
    }

    /// Stop handing out buffers and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.free.clear();
        drop(state);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Buffers currently held by workers or awaiting the consumer
    pub fn checked_out(&self) -> usize {
        lock(&self.state).checked_out
    }

    /// Highest `checked_out` value seen over the pool's lifetime
    pub fn peak_checked_out(&self) -> usize {
        lock(&self.state).peak_checked_out
    }
}
