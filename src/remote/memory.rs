//! In-memory remote store for testing
//!
//! `MemoryRemote` implements every remote collaborator against process memory.
//! Tests use it to script failures, slow down individual ranges so chunks
//! complete out of order, and inspect what the engine actually sent.

use super::{
    AuthContext, LargeFileApi, ObjectSource, RangeResponse, Reauthenticate, RemoteFile,
    RemoteObjectHandle, StartLargeFile, UploadTarget,
};
use crate::digest::sha1_hex;
use crate::error::{ProtocolError, Result, TransferError, TransportKind};
use crate::util::lock;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use skyhaul_core_resilience::Operation;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default size of the pieces a range body is streamed in
pub const DEFAULT_PIECE_SIZE: usize = 64 * 1024;

type LatencyFn = Arc<dyn Fn(u64) -> Duration + Send + Sync>;

#[derive(Debug, Default)]
struct LargeFile {
    bucket: String,
    name: String,
    parts: HashMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Faults {
    /// Scripted failures keyed by range offset, consumed front to back
    ranges: HashMap<u64, VecDeque<TransferError>>,
    /// Scripted failures keyed by operation, consumed front to back
    operations: HashMap<Operation, VecDeque<TransferError>>,
    /// Offsets whose body is delivered one byte short
    short_bodies: Vec<u64>,
}

/// In-memory implementation of the remote collaborators
pub struct MemoryRemote {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    large_files: Mutex<HashMap<String, LargeFile>>,
    targets: Mutex<HashMap<String, String>>,
    faults: Mutex<Faults>,
    latency: Mutex<Option<LatencyFn>>,
    piece_delay: Mutex<Duration>,
    piece_size: AtomicUsize,

    range_log: Mutex<Vec<(u64, u64)>>,
    manifests: Mutex<Vec<Vec<String>>>,
    active_fetches: AtomicUsize,
    peak_fetches: AtomicUsize,
    next_id: AtomicU64,
    reauth_count: AtomicU64,
    cancel_count: AtomicU64,
    targets_issued: AtomicU64,
    auth_expired: AtomicBool,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            large_files: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(None),
            piece_delay: Mutex::new(Duration::ZERO),
            piece_size: AtomicUsize::new(DEFAULT_PIECE_SIZE),
            range_log: Mutex::new(Vec::new()),
            manifests: Mutex::new(Vec::new()),
            active_fetches: AtomicUsize::new(0),
            peak_fetches: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            reauth_count: AtomicU64::new(0),
            cancel_count: AtomicU64::new(0),
            targets_issued: AtomicU64::new(0),
            auth_expired: AtomicBool::new(false),
        }
    }

    /// Store an object and return its handle
    pub fn put_object(
        &self,
        bucket: &str,
        name: &str,
        data: impl Into<Bytes>,
    ) -> RemoteObjectHandle {
        let data = data.into();
        let handle = RemoteObjectHandle::new(bucket, name, data.len() as u64);
        lock(&self.objects).insert((bucket.to_string(), name.to_string()), data);
        handle
    }

    /// Contents of a stored object
    pub fn get_object(&self, bucket: &str, name: &str) -> Option<Bytes> {
        lock(&self.objects)
            .get(&(bucket.to_string(), name.to_string()))
            .cloned()
    }

    /// A fake account session pointing at this store
    pub fn auth_context(&self) -> AuthContext {
        AuthContext {
            account_id: "memory".to_string(),
            api_url: "memory://api".to_string(),
            download_url: "memory://download".to_string(),
            auth_token: format!("token-{}", self.reauth_count.load(Ordering::SeqCst)),
            min_part_size: 1,
        }
    }

    /// Size of the pieces a range body is streamed in
    pub fn set_piece_size(&self, size: usize) {
        self.piece_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Pause between body pieces, so a copy can be interrupted midway
    pub fn set_piece_delay(&self, delay: Duration) {
        *lock(&self.piece_delay) = delay;
    }

    /// Delay each range response by `latency(offset)`
    pub fn set_latency<F>(&self, latency: F)
    where
        F: Fn(u64) -> Duration + Send + Sync + 'static,
    {
        *lock(&self.latency) = Some(Arc::new(latency));
    }

    /// Fail the next fetch of the range starting at `offset`
    pub fn fail_range_at(&self, offset: u64, error: TransferError) {
        lock(&self.faults)
            .ranges
            .entry(offset)
            .or_default()
            .push_back(error);
    }

    /// Deliver the range starting at `offset` one byte short
    pub fn truncate_range_at(&self, offset: u64) {
        lock(&self.faults).short_bodies.push(offset);
    }

    /// Fail the next call of `operation`
    pub fn fail_next(&self, operation: Operation, error: TransferError) {
        lock(&self.faults)
            .operations
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Make every call answer 401 until `reauthenticate` is called
    pub fn expire_auth(&self) {
        self.auth_expired.store(true, Ordering::SeqCst);
    }

    /// Invalidate every upload target issued so far
    pub fn expire_upload_targets(&self) {
        lock(&self.targets).clear();
    }

    /// Every `(offset, length)` range requested so far, in request order
    pub fn range_requests(&self) -> Vec<(u64, u64)> {
        lock(&self.range_log).clone()
    }

    /// Highest number of range requests awaiting their response at once
    pub fn peak_concurrent_fetches(&self) -> usize {
        self.peak_fetches.load(Ordering::SeqCst)
    }

    /// Every manifest submitted to `finish_large_file`
    pub fn submitted_manifests(&self) -> Vec<Vec<String>> {
        lock(&self.manifests).clone()
    }

    /// Number of upload targets issued
    pub fn targets_issued(&self) -> u64 {
        self.targets_issued.load(Ordering::SeqCst)
    }

    /// Number of successful reauthentications
    pub fn reauth_count(&self) -> u64 {
        self.reauth_count.load(Ordering::SeqCst)
    }

    /// Number of large files cancelled
    pub fn cancel_count(&self) -> u64 {
        self.cancel_count.load(Ordering::SeqCst)
    }

    /// Number of parts currently stored for `file_id`
    pub fn stored_parts(&self, file_id: &str) -> usize {
        lock(&self.large_files)
            .get(file_id)
            .map(|f| f.parts.len())
            .unwrap_or(0)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Next scripted failure for `operation`, if any
    fn scripted(&self, operation: Operation) -> Result<()> {
        match lock(&self.faults)
            .operations
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Scripted failure or auth expiry for `operation`, if any
    fn check(&self, operation: Operation) -> Result<()> {
        self.scripted(operation)?;
        if self.auth_expired.load(Ordering::SeqCst) {
            return Err(ProtocolError::new(operation, 401, "authorization token expired")
                .with_code("expired_auth_token")
                .into());
        }
        Ok(())
    }

    fn enter_fetch(&self) -> FetchGuard<'_> {
        let now = self.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_fetches.fetch_max(now, Ordering::SeqCst);
        FetchGuard(&self.active_fetches)
    }
}

struct FetchGuard<'a>(&'a AtomicUsize);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectSource for MemoryRemote {
    async fn fetch_range(
        &self,
        object: &RemoteObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<RangeResponse> {
        lock(&self.range_log).push((offset, length));
        let _guard = self.enter_fetch();

        let latency = lock(&self.latency).clone();
        if let Some(latency) = latency {
            let delay = latency(offset);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        self.check(Operation::DownloadFileByName)?;
        let scripted = lock(&self.faults)
            .ranges
            .get_mut(&offset)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }

        let data = self
            .get_object(&object.bucket, &object.name)
            .ok_or_else(|| {
                TransferError::from(
                    ProtocolError::new(Operation::DownloadFileByName, 404, "file not present")
                        .with_code("not_found"),
                )
            })?;

        let total = data.len() as u64;
        if offset > total || (offset == total && total > 0) {
            return Err(ProtocolError::new(
                Operation::DownloadFileByName,
                416,
                format!("range start {} beyond object size {}", offset, total),
            )
            .with_code("range_not_satisfiable")
            .into());
        }

        let end = if length == 0 {
            total
        } else {
            (offset + length).min(total)
        };
        let mut slice = data.slice(offset as usize..end as usize);
        if lock(&self.faults).short_bodies.contains(&offset) && !slice.is_empty() {
            slice.truncate(slice.len() - 1);
        }

        let content_length = slice.len() as u64;
        let piece_size = self.piece_size.load(Ordering::SeqCst);
        let piece_delay = *lock(&self.piece_delay);
        let pieces: Vec<Bytes> = (0..slice.len())
            .step_by(piece_size)
            .map(|start| slice.slice(start..(start + piece_size).min(slice.len())))
            .collect();

        let body = futures::stream::iter(pieces)
            .then(move |piece| async move {
                if !piece_delay.is_zero() {
                    tokio::time::sleep(piece_delay).await;
                }
                Ok::<_, TransferError>(piece)
            })
            .boxed();

        Ok(RangeResponse {
            body,
            content_length,
            content_sha1: Some(sha1_hex(&data)),
            content_type: Some("application/octet-stream".to_string()),
            info: HashMap::new(),
        })
    }
}

#[async_trait]
impl LargeFileApi for MemoryRemote {
    async fn start_large_file(&self, params: &StartLargeFile) -> Result<String> {
        self.check(Operation::StartLargeFile)?;
        let file_id = self.next_id("file");
        lock(&self.large_files).insert(
            file_id.clone(),
            LargeFile {
                bucket: params.bucket_id.clone(),
                name: params.name.clone(),
                parts: HashMap::new(),
            },
        );
        Ok(file_id)
    }

    async fn get_upload_part_target(&self, file_id: &str) -> Result<UploadTarget> {
        self.check(Operation::GetUploadPartUrl)?;
        if !lock(&self.large_files).contains_key(file_id) {
            return Err(ProtocolError::new(
                Operation::GetUploadPartUrl,
                400,
                format!("no such large file: {}", file_id),
            )
            .with_code("bad_request")
            .into());
        }
        let token = self.next_id("upload-token");
        lock(&self.targets).insert(token.clone(), file_id.to_string());
        self.targets_issued.fetch_add(1, Ordering::SeqCst);
        Ok(UploadTarget {
            url: format!("memory://upload/{}", file_id),
            token,
        })
    }

    async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        sha1: &str,
        data: Bytes,
    ) -> Result<()> {
        self.check(Operation::UploadPart)?;
        let file_id = lock(&self.targets).get(&target.token).cloned().ok_or_else(|| {
            TransferError::from(
                ProtocolError::new(Operation::UploadPart, 401, "upload token expired")
                    .with_code("expired_auth_token"),
            )
        })?;

        let actual = sha1_hex(&data);
        if actual != sha1 {
            return Err(ProtocolError::new(
                Operation::UploadPart,
                400,
                format!("sha1 did not match data received: {} != {}", sha1, actual),
            )
            .with_code("bad_request")
            .into());
        }

        let mut files = lock(&self.large_files);
        let file = files.get_mut(&file_id).ok_or_else(|| {
            TransferError::from(ProtocolError::new(
                Operation::UploadPart,
                400,
                format!("large file {} is not in progress", file_id),
            ))
        })?;
        file.parts.insert(part_number, (actual, data));
        Ok(())
    }

    async fn finish_large_file(&self, file_id: &str, part_sha1s: &[String]) -> Result<RemoteFile> {
        self.check(Operation::FinishLargeFile)?;
        lock(&self.manifests).push(part_sha1s.to_vec());

        let file = lock(&self.large_files).remove(file_id).ok_or_else(|| {
            TransferError::from(ProtocolError::new(
                Operation::FinishLargeFile,
                400,
                format!("no such large file: {}", file_id),
            ))
        })?;

        let mut assembled = Vec::new();
        let mut mismatch = None;
        for (index, expected) in part_sha1s.iter().enumerate() {
            let part_number = index as u32 + 1;
            match file.parts.get(&part_number) {
                Some((sha1, data)) if sha1 == expected => assembled.extend_from_slice(data),
                _ => {
                    mismatch = Some(part_number);
                    break;
                }
            }
        }
        if let Some(part_number) = mismatch {
            lock(&self.large_files).insert(file_id.to_string(), file);
            return Err(ProtocolError::new(
                Operation::FinishLargeFile,
                400,
                format!("part {} sha1 does not match uploaded part", part_number),
            )
            .with_code("bad_request")
            .into());
        }

        let size = assembled.len() as u64;
        self.put_object(&file.bucket, &file.name, assembled);
        Ok(RemoteFile {
            file_id: file_id.to_string(),
            name: file.name,
            size,
        })
    }

    async fn cancel_large_file(&self, file_id: &str) -> Result<()> {
        self.check(Operation::CancelLargeFile)?;
        if lock(&self.large_files).remove(file_id).is_none() {
            return Err(ProtocolError::new(
                Operation::CancelLargeFile,
                400,
                format!("no such large file: {}", file_id),
            )
            .into());
        }
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Reauthenticate for MemoryRemote {
    async fn reauthenticate(&self) -> Result<()> {
        self.scripted(Operation::AuthorizeAccount)?;
        self.auth_expired.store(false, Ordering::SeqCst);
        self.reauth_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Convenience constructor for a transport failure used in fault scripts
pub fn connection_reset() -> TransferError {
    TransferError::transport(TransportKind::Connect, "connection reset by peer")
}
