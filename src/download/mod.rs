//! Chunked parallel downloads
//!
//! [`ChunkedDownloadReader`] turns one remote object into a sequential byte
//! stream while `concurrency` workers fetch fixed-size chunks over range
//! requests. A [`ChunkBufferPool`] of `concurrency` buffers bounds how far the
//! workers may run ahead of the consumer.

mod pool;
mod reader;

pub use pool::{ChunkBuffer, ChunkBufferPool};
pub use reader::{
    ChunkedDownloadReader, DownloadOptions, DownloadStats, DEFAULT_CHUNK_SIZE,
    DEFAULT_CONCURRENCY,
};
