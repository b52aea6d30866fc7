//! Type definitions shared by the remote collaborators

use crate::error::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A named object inside a bucket, with its known total size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObjectHandle {
    /// Bucket name
    pub bucket: String,

    /// Object name within the bucket
    pub name: String,

    /// Total size in bytes
    pub size: u64,
}

impl RemoteObjectHandle {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            size,
        }
    }
}

impl fmt::Display for RemoteObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// Body of a range response, delivered piecewise
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Result of a range fetch
pub struct RangeResponse {
    /// Response body
    pub body: ByteStream,

    /// Number of bytes the body will yield
    pub content_length: u64,

    /// SHA-1 of the whole object, as reported by the service
    pub content_sha1: Option<String>,

    /// Content type of the object
    pub content_type: Option<String>,

    /// Custom object metadata
    pub info: HashMap<String, String>,
}

impl fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("content_length", &self.content_length)
            .field("content_sha1", &self.content_sha1)
            .field("content_type", &self.content_type)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// A short-lived upload URL and the token authorizing it
#[derive(Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub url: String,
    pub token: String,
}

impl fmt::Debug for UploadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadTarget")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Account-scoped session context produced by authorization
#[derive(Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub account_id: String,
    pub api_url: String,
    pub download_url: String,
    pub auth_token: String,

    /// Smallest part size the service accepts (except for the last part)
    pub min_part_size: u64,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("account_id", &self.account_id)
            .field("api_url", &self.api_url)
            .field("download_url", &self.download_url)
            .field("auth_token", &"<redacted>")
            .field("min_part_size", &self.min_part_size)
            .finish()
    }
}

/// A finished object on the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    pub name: String,
    pub size: u64,
}

/// One recorded part of a large-file upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPartRecord {
    /// 1-based part number
    pub part_number: u32,

    /// Hex SHA-1 of the part bytes
    pub sha1: String,

    /// Part size in bytes
    pub size: u64,
}

/// Parameters for starting a large file
#[derive(Debug, Clone, Default)]
pub struct StartLargeFile {
    pub bucket_id: String,
    pub name: String,
    pub content_type: String,
    pub info: HashMap<String, String>,
}

/// Build the HTTP `Range` header for `length` bytes at `offset`.
///
/// A zero length means "to the end of the object"; `(0, 0)` needs no header.
pub fn range_header(offset: u64, length: u64) -> Option<String> {
    match (offset, length) {
        (0, 0) => None,
        (o, 0) => Some(format!("bytes={}-", o)),
        (o, l) => Some(format!("bytes={}-{}", o, o + l - 1)),
    }
}
