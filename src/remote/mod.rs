//! Remote collaborators of the transfer engine
//!
//! The engine does not talk HTTP itself. It consumes three narrow interfaces:
//!
//! - [`ObjectSource`]: ranged reads of a named object
//! - [`LargeFileApi`]: upload targets, part uploads, manifest submission
//!   and cancellation for one large file
//! - [`Reauthenticate`]: refresh the account session after a 401
//!
//! Two implementations ship with the crate:
//!
//! - [`http::HttpRemote`]: the native HTTP API of the storage service
//! - [`memory::MemoryRemote`]: an in-memory store with fault and latency
//!   injection, for tests
//!
//! # Example
//!
//! ```no_run
//! use skyhaul::download::{ChunkedDownloadReader, DownloadOptions};
//! use skyhaul::remote::memory::MemoryRemote;
//! use std::sync::Arc;
//!
//! # async fn example() -> skyhaul::Result<()> {
//! let remote = Arc::new(MemoryRemote::new());
//! let handle = remote.put_object("bucket", "movie.mkv", vec![7u8; 25_000_000]);
//!
//! let mut reader = ChunkedDownloadReader::new(
//!     remote,
//!     handle,
//!     DownloadOptions { chunk_size: 10_000_000, concurrency: 3 },
//! );
//! let bytes = reader.read_to_end().await?;
//! assert_eq!(bytes.len(), 25_000_000);
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod memory;
mod types;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use types::{
    range_header, AuthContext, ByteStream, RangeResponse, RemoteFile, RemoteObjectHandle,
    StartLargeFile, UploadPartRecord, UploadTarget,
};

/// Ranged reads of remote objects
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Fetch `length` bytes of `object` starting at `offset`.
    ///
    /// A zero `length` means "to the end of the object".
    async fn fetch_range(
        &self,
        object: &RemoteObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<RangeResponse>;
}

/// Operations on large files being uploaded in parts
#[async_trait]
pub trait LargeFileApi: Send + Sync {
    /// Reserve a new large file and return its identifier
    async fn start_large_file(&self, params: &StartLargeFile) -> Result<String>;

    /// Get a fresh upload URL and token for parts of `file_id`
    async fn get_upload_part_target(&self, file_id: &str) -> Result<UploadTarget>;

    /// Upload one part to `target`
    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        sha1: &str,
        data: Bytes,
    ) -> Result<()>;

    /// Submit the ordered part digests and turn the parts into one object
    async fn finish_large_file(&self, file_id: &str, part_sha1s: &[String]) -> Result<RemoteFile>;

    /// Release the reservation for `file_id`, discarding uploaded parts
    async fn cancel_large_file(&self, file_id: &str) -> Result<()>;
}

/// Refresh of the account session after its token expired
#[async_trait]
pub trait Reauthenticate: Send + Sync {
    async fn reauthenticate(&self) -> Result<()>;
}
