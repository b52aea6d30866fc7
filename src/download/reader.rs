/*!
 * Chunked parallel download with in-order delivery
 *
 * A reader splits one remote object into fixed-size chunks and lets
 * `concurrency` workers fetch them over range requests. Chunks may complete
 * in any order; the reader hands bytes to its consumer strictly in chunk
 * order. The first worker failure is latched and returned by every later
 * `read`.
 */

use super::pool::{ChunkBuffer, ChunkBufferPool};
use crate::error::{CancelReason, Result, TransferError, TransportKind};
use crate::remote::{ObjectSource, RemoteObjectHandle};
use crate::util::lock;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Chunk size used when none (or zero) is configured
pub const DEFAULT_CHUNK_SIZE: u64 = 10_000_000;

/// Worker count used when none (or zero) is configured
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Chunking parameters for one download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Bytes per range request
    pub chunk_size: u64,

    /// Number of workers, and of chunks that may be outstanding at once
    pub concurrency: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl DownloadOptions {
    /// Replace zero values with the defaults
    pub fn normalized(self) -> Self {
        Self {
            chunk_size: if self.chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                self.chunk_size
            },
            concurrency: if self.concurrency == 0 {
                DEFAULT_CONCURRENCY
            } else {
                self.concurrency
            },
        }
    }
}

/// Counters describing a reader's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    /// Range requests issued
    pub chunks_dispatched: u64,

    /// Most chunks ever in flight or waiting to be read at once
    pub peak_outstanding: usize,

    /// Bytes returned to the consumer
    pub bytes_consumed: u64,
}

#[derive(Default)]
struct SessionState {
    next_dispatch: u64,
    completed: HashMap<u64, ChunkBuffer>,
    error: Option<TransferError>,
    cancel_reason: Option<CancelReason>,
}

/// State shared between the reader and its workers
struct Shared {
    source: Arc<dyn ObjectSource>,
    object: RemoteObjectHandle,
    chunk_size: u64,
    start: u64,
    end: u64,
    pool: ChunkBufferPool,
    state: Mutex<SessionState>,
    changed: Notify,
    cancel: CancellationToken,
    chunks_dispatched: AtomicU64,
}

impl Shared {
    /// Latch `err` unless an earlier error already won, then stop everything
    fn fail(&self, err: TransferError) {
        {
            let mut state = lock(&self.state);
            if state.error.is_none() {
                state.error = Some(err);
            }
        }
        self.pool.close();
        self.cancel.cancel();
        self.changed.notify_waiters();
    }

    /// Cancel the session, recording why unless a reason is already set
    fn cancel_with(&self, reason: CancelReason) {
        lock(&self.state).cancel_reason.get_or_insert(reason);
        self.pool.close();
        self.cancel.cancel();
        self.changed.notify_waiters();
    }

    fn latched_error(&self) -> Option<TransferError> {
        lock(&self.state).error.clone()
    }

    /// The error that ended the session: the latched failure if any, else
    /// the cancellation
    fn terminal_error(&self) -> TransferError {
        let state = lock(&self.state);
        match &state.error {
            Some(err) => err.clone(),
            None => {
                TransferError::Cancelled(state.cancel_reason.unwrap_or(CancelReason::Caller))
            }
        }
    }
}

struct Session {
    shared: Arc<Shared>,
    // Dropping the set aborts any worker still running
    _workers: JoinSet<()>,
}

/// Sequential reader over a remote object, fed by parallel range requests
pub struct ChunkedDownloadReader {
    source: Arc<dyn ObjectSource>,
    object: RemoteObjectHandle,
    options: DownloadOptions,
    start: u64,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    session: Option<Session>,
    consume_index: u64,
    current: Option<ChunkBuffer>,
    consumed: u64,
    closed: bool,
}

impl ChunkedDownloadReader {
    /// Create a reader. No request is made until the first `read`.
    pub fn new(
        source: Arc<dyn ObjectSource>,
        object: RemoteObjectHandle,
        options: DownloadOptions,
    ) -> Self {
        Self {
            source,
            object,
            options: options.normalized(),
            start: 0,
            deadline: None,
            cancel: CancellationToken::new(),
            session: None,
            consume_index: 0,
            current: None,
            consumed: 0,
            closed: false,
        }
    }

    /// Begin reading at byte `offset` instead of the start of the object
    pub fn starting_at(mut self, offset: u64) -> Self {
        self.start = offset.min(self.object.size);
        self
    }

    /// Tie the reader to a caller's cancellation scope
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    /// Give up with `DeadlineExceeded` if the transfer is still running at `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Token that cancels this reader when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn object(&self) -> &RemoteObjectHandle {
        &self.object
    }

    pub fn options(&self) -> DownloadOptions {
        self.options
    }

    /// Absolute offset of the next byte `read` will return
    pub fn position(&self) -> u64 {
        self.start + self.consumed
    }

    fn total(&self) -> u64 {
        self.object.size - self.start
    }

    pub fn stats(&self) -> DownloadStats {
        match &self.session {
            Some(session) => DownloadStats {
                chunks_dispatched: session.shared.chunks_dispatched.load(Ordering::SeqCst),
                peak_outstanding: session.shared.pool.peak_checked_out(),
                bytes_consumed: self.consumed,
            },
            None => DownloadStats {
                bytes_consumed: self.consumed,
                ..Default::default()
            },
        }
    }

    fn ensure_started(&mut self) -> Arc<Shared> {
        if let Some(session) = &self.session {
            return Arc::clone(&session.shared);
        }

        let concurrency = self.options.concurrency;
        debug!(
            object = %self.object,
            size = self.object.size,
            offset = self.start,
            chunk_size = self.options.chunk_size,
            concurrency,
            "starting chunked download"
        );

        let shared = Arc::new(Shared {
            source: Arc::clone(&self.source),
            object: self.object.clone(),
            chunk_size: self.options.chunk_size,
            start: self.start,
            end: self.object.size,
            pool: ChunkBufferPool::new(concurrency),
            state: Mutex::new(SessionState::default()),
            changed: Notify::new(),
            cancel: self.cancel.clone(),
            chunks_dispatched: AtomicU64::new(0),
        });

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            workers.spawn(run_worker(Arc::clone(&shared), worker));
        }
        if let Some(deadline) = self.deadline {
            let shared = Arc::clone(&shared);
            workers.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        shared.cancel_with(CancelReason::DeadlineExceeded);
                    }
                    _ = shared.cancel.cancelled() => {}
                }
            });
        }

        self.session = Some(Session {
            shared: Arc::clone(&shared),
            _workers: workers,
        });
        shared
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` at end of object. After a failure every call returns
    /// the same error, including calls with an empty buffer.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(TransferError::Cancelled(CancelReason::Closed));
        }
        if self.consumed >= self.total() {
            return Ok(0);
        }
        if buf.is_empty() {
            return match &self.session {
                Some(session) => session.shared.latched_error().map_or(Ok(0), Err),
                None => Ok(0),
            };
        }

        let shared = self.ensure_started();
        let mut chunk = match self.current.take() {
            Some(chunk) => chunk,
            None => Self::wait_for_chunk(&shared, self.consume_index).await?,
        };

        let n = chunk.read_into(buf);
        self.consumed += n as u64;
        self.finish_or_keep(&shared, chunk);
        Ok(n)
    }

    /// Hand a drained chunk back to the pool or keep it for the next read
    fn finish_or_keep(&mut self, shared: &Shared, chunk: ChunkBuffer) {
        if !chunk.is_drained() {
            self.current = Some(chunk);
            return;
        }

        trace!(object = %self.object, chunk = self.consume_index, "chunk consumed");
        self.consume_index += 1;
        if self.consumed >= self.total() {
            debug!(object = %self.object, bytes = self.consumed, "download complete");
            shared.pool.close();
        } else {
            shared.pool.put(chunk);
        }
    }

    async fn wait_for_chunk(shared: &Shared, index: u64) -> Result<ChunkBuffer> {
        loop {
            let changed = shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = lock(&shared.state);
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }
                if let Some(chunk) = state.completed.remove(&index) {
                    return Ok(chunk);
                }
            }
            if shared.cancel.is_cancelled() {
                return Err(shared.terminal_error());
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = shared.cancel.cancelled() => {}
            }
        }
    }

    /// Copy the rest of the object into `writer`, returning the bytes written.
    ///
    /// On failure `position()` is the offset of the first byte the writer
    /// did not accept. Writer failures surface as `TransferError::Local`.
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.closed {
            return Err(TransferError::Cancelled(CancelReason::Closed));
        }

        let mut written = 0u64;
        while self.consumed < self.total() {
            let shared = self.ensure_started();
            let mut chunk = match self.current.take() {
                Some(chunk) => chunk,
                None => Self::wait_for_chunk(&shared, self.consume_index).await?,
            };

            while !chunk.is_drained() {
                let outcome = tokio::select! {
                    r = writer.write(chunk.remaining()) => Some(r),
                    _ = shared.cancel.cancelled() => None,
                };
                let n = match outcome {
                    Some(Ok(0)) => {
                        self.current = Some(chunk);
                        return Err(TransferError::local(io::ErrorKind::WriteZero.into()));
                    }
                    Some(Ok(n)) => n,
                    Some(Err(e)) => {
                        self.current = Some(chunk);
                        return Err(TransferError::local(e));
                    }
                    None => {
                        self.current = Some(chunk);
                        return Err(shared.terminal_error());
                    }
                };
                // Only bytes the sink accepted count towards the position
                chunk.consume(n);
                self.consumed += n as u64;
                written += n as u64;
            }
            self.finish_or_keep(&shared, chunk);
        }

        writer.flush().await.map_err(TransferError::local)?;
        Ok(written)
    }

    /// Read the rest of the object into memory
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = usize::try_from(self.total() - self.consumed).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(remaining);
        self.copy_to(&mut out).await?;
        Ok(out)
    }

    /// Cancel outstanding work and release buffers. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        if let Some(session) = &self.session {
            session.shared.cancel_with(CancelReason::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ChunkedDownloadReader {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(shared: Arc<Shared>, worker: usize) {
    loop {
        let buffer = tokio::select! {
            buffer = shared.pool.take() => buffer,
            _ = shared.cancel.cancelled() => None,
        };
        let Some(mut buffer) = buffer else {
            trace!(worker, "worker stopping: pool closed");
            return;
        };

        let (index, offset, len) = {
            let mut state = lock(&shared.state);
            if state.error.is_some() {
                drop(state);
                shared.pool.put(buffer);
                return;
            }
            let index = state.next_dispatch;
            let offset = shared.start + index * shared.chunk_size;
            if offset >= shared.end {
                drop(state);
                shared.pool.put(buffer);
                trace!(worker, "worker stopping: all chunks claimed");
                return;
            }
            state.next_dispatch += 1;
            (index, offset, shared.chunk_size.min(shared.end - offset))
        };

        shared.chunks_dispatched.fetch_add(1, Ordering::SeqCst);
        trace!(worker, object = %shared.object, chunk = index, offset, len, "fetching chunk");

        match fetch_chunk(&shared, &mut buffer, offset, len).await {
            Ok(()) => {
                lock(&shared.state).completed.insert(index, buffer);
                shared.changed.notify_waiters();
            }
            Err(err) if err.is_cancelled() => {
                shared.pool.put(buffer);
                return;
            }
            Err(err) => {
                warn!(
                    object = %shared.object,
                    chunk = index,
                    offset,
                    error = %err,
                    "chunk download failed"
                );
                shared.pool.put(buffer);
                shared.fail(err);
                return;
            }
        }
    }
}

/// Fetch one range into `buffer`, watching for cancellation between pieces
async fn fetch_chunk(
    shared: &Shared,
    buffer: &mut ChunkBuffer,
    offset: u64,
    len: u64,
) -> Result<()> {
    let cancelled = || TransferError::Cancelled(CancelReason::Caller);

    let response = tokio::select! {
        r = shared.source.fetch_range(&shared.object, offset, len) => r?,
        _ = shared.cancel.cancelled() => return Err(cancelled()),
    };
    if response.content_length != len {
        return Err(short_read(offset, len, response.content_length));
    }

    buffer.reset();
    buffer.reserve(len as usize);
    let mut body = response.body;
    loop {
        let piece = tokio::select! {
            piece = body.next() => piece,
            _ = shared.cancel.cancelled() => return Err(cancelled()),
        };
        match piece {
            Some(piece) => {
                let piece = piece?;
                if (buffer.len() + piece.len()) as u64 > len {
                    return Err(short_read(offset, len, (buffer.len() + piece.len()) as u64));
                }
                buffer.extend(&piece);
            }
            None => break,
        }
    }

    if buffer.len() as u64 != len {
        return Err(short_read(offset, len, buffer.len() as u64));
    }
    Ok(())
}

fn short_read(offset: u64, expected: u64, actual: u64) -> TransferError {
    TransferError::transport(
        TransportKind::ShortRead,
        format!(
            "range at offset {} returned {} bytes, expected {}",
            offset, actual, expected
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{connection_reset, MemoryRemote};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Accepts at most `budget` bytes, then fails every write
    struct CappedSink {
        data: Vec<u8>,
        budget: usize,
    }

    impl AsyncWrite for CappedSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let room = self.budget - self.data.len();
            if room == 0 {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "sink full")));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_options_normalized() {
        let options = DownloadOptions {
            chunk_size: 0,
            concurrency: 0,
        }
        .normalized();
        assert_eq!(options, DownloadOptions::default());

        let options = DownloadOptions {
            chunk_size: 7,
            concurrency: 3,
        }
        .normalized();
        assert_eq!(options.chunk_size, 7);
        assert_eq!(options.concurrency, 3);
    }

    #[tokio::test]
    async fn test_construction_is_lazy() {
        let remote = Arc::new(MemoryRemote::new());
        let handle = remote.put_object("b", "o", pattern(100));
        let reader = ChunkedDownloadReader::new(
            remote.clone(),
            handle,
            DownloadOptions {
                chunk_size: 10,
                concurrency: 2,
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(remote.range_requests().is_empty());
        assert_eq!(reader.stats(), DownloadStats::default());
    }

    #[tokio::test]
    async fn test_small_reads_cross_chunk_boundaries() {
        let remote = Arc::new(MemoryRemote::new());
        let data = pattern(95);
        let handle = remote.put_object("b", "o", data.clone());
        let mut reader = ChunkedDownloadReader::new(
            remote,
            handle,
            DownloadOptions {
                chunk_size: 10,
                concurrency: 3,
            },
        );

        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.stats().chunks_dispatched, 10);
    }

    #[tokio::test]
    async fn test_starting_at_resumes_mid_object() {
        let remote = Arc::new(MemoryRemote::new());
        let data = pattern(50);
        let handle = remote.put_object("b", "o", data.clone());
        let mut reader = ChunkedDownloadReader::new(
            remote.clone(),
            handle,
            DownloadOptions {
                chunk_size: 16,
                concurrency: 2,
            },
        )
        .starting_at(20);

        assert_eq!(reader.read_to_end().await.unwrap(), &data[20..]);
        let mut ranges = remote.range_requests();
        ranges.sort();
        assert_eq!(ranges, vec![(20, 16), (36, 14)]);
        assert_eq!(reader.position(), 50);
    }

    #[tokio::test]
    async fn test_short_body_latches_short_read() {
        let remote = Arc::new(MemoryRemote::new());
        let handle = remote.put_object("b", "o", pattern(30));
        remote.truncate_range_at(10);
        let mut reader = ChunkedDownloadReader::new(
            remote,
            handle,
            DownloadOptions {
                chunk_size: 10,
                concurrency: 1,
            },
        );

        let err = reader.read_to_end().await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Transport {
                kind: TransportKind::ShortRead,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        let remote = Arc::new(MemoryRemote::new());
        let handle = remote.put_object("b", "o", pattern(40));
        remote.fail_range_at(0, connection_reset());
        let mut reader = ChunkedDownloadReader::new(
            remote,
            handle,
            DownloadOptions {
                chunk_size: 10,
                concurrency: 1,
            },
        );

        let mut buf = [0u8; 8];
        let first = reader.read(&mut buf).await.unwrap_err();
        let second = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(first, connection_reset());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let remote = Arc::new(MemoryRemote::new());
        let handle = remote.put_object("b", "o", pattern(40));
        let mut reader =
            ChunkedDownloadReader::new(remote, handle, DownloadOptions::default());

        let mut buf = [0u8; 8];
        reader.read(&mut buf).await.unwrap();
        reader.close();
        reader.close();
        assert_eq!(
            reader.read(&mut buf).await.unwrap_err(),
            TransferError::Cancelled(CancelReason::Closed)
        );
    }

    #[tokio::test]
    async fn test_empty_object_is_immediately_done() {
        let remote = Arc::new(MemoryRemote::new());
        let handle = remote.put_object("b", "empty", Vec::new());
        let mut reader =
            ChunkedDownloadReader::new(remote.clone(), handle, DownloadOptions::default());

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(remote.range_requests().is_empty());
    }

    #[tokio::test]
    async fn test_partial_sink_write_keeps_exact_position() {
        let remote = Arc::new(MemoryRemote::new());
        let data = pattern(100);
        let handle = remote.put_object("b", "o", data.clone());
        let mut reader = ChunkedDownloadReader::new(
            remote,
            handle,
            DownloadOptions {
                chunk_size: 50,
                concurrency: 1,
            },
        );

        let mut sink = CappedSink {
            data: Vec::new(),
            budget: 30,
        };
        let err = reader.copy_to(&mut sink).await.unwrap_err();
        assert!(err.is_local());
        assert_eq!(reader.position(), 30);
        assert_eq!(sink.data, &data[..30]);

        // The unaccepted tail of the chunk is still there for the next copy
        sink.budget = 100;
        assert_eq!(reader.copy_to(&mut sink).await.unwrap(), 70);
        assert_eq!(sink.data, data);
    }

    #[tokio::test]
    async fn test_empty_read_reports_latched_error() {
        let remote = Arc::new(MemoryRemote::new());
        let handle = remote.put_object("b", "o", pattern(40));
        remote.fail_range_at(0, connection_reset());
        let mut reader = ChunkedDownloadReader::new(
            remote.clone(),
            handle,
            DownloadOptions {
                chunk_size: 10,
                concurrency: 1,
            },
        );

        // Nothing started yet, so an empty read has nothing to report
        assert_eq!(reader.read(&mut []).await.unwrap(), 0);
        assert!(remote.range_requests().is_empty());

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(reader.read(&mut []).await.unwrap_err(), err);
    }
}
