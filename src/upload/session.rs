/*!
 * Multipart upload session for one large file
 *
 * Parts may be uploaded concurrently and in any order. Each success records
 * `(part number, sha1, size)`; `finalize` turns the records into the ordered
 * digest manifest the service expects, where part `p` sits at position
 * `p - 1`.
 */

use crate::error::{Result, TransferError};
use crate::remote::{LargeFileApi, RemoteFile, StartLargeFile, UploadPartRecord, UploadTarget};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Finished,
    Cancelled,
}

#[derive(Debug)]
struct UploadState {
    parts: BTreeMap<u32, UploadPartRecord>,
    total_size: u64,
    status: Status,
}

impl UploadState {
    fn ensure_open(&self, file_id: &str) -> Result<()> {
        match self.status {
            Status::Open => Ok(()),
            Status::Finished => Err(TransferError::validation(format!(
                "large file {} is already finished",
                file_id
            ))),
            Status::Cancelled => Err(TransferError::validation(format!(
                "large file {} was cancelled",
                file_id
            ))),
        }
    }
}

/// Tracks the parts of one large-file upload and finalizes it
pub struct LargeFileUploadSession {
    api: Arc<dyn LargeFileApi>,
    file_id: String,
    state: Mutex<UploadState>,
}

impl LargeFileUploadSession {
    /// Attach to a large file that has already been started
    pub fn new(api: Arc<dyn LargeFileApi>, file_id: impl Into<String>) -> Self {
        Self {
            api,
            file_id: file_id.into(),
            state: Mutex::new(UploadState {
                parts: BTreeMap::new(),
                total_size: 0,
                status: Status::Open,
            }),
        }
    }

    /// Start a new large file and open a session for it
    pub async fn start(api: Arc<dyn LargeFileApi>, params: &StartLargeFile) -> Result<Self> {
        let file_id = api.start_large_file(params).await?;
        info!(file_id = %file_id, name = %params.name, "started large file");
        Ok(Self::new(api, file_id))
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Get a fresh upload target for this file's parts.
    ///
    /// Targets are independent: each concurrent uploader should hold its own.
    pub async fn acquire_upload_target(&self) -> Result<UploadTarget> {
        self.state.lock().await.ensure_open(&self.file_id)?;
        self.api.get_upload_part_target(&self.file_id).await
    }

    /// Upload one part and record it.
    ///
    /// Uploading a part number again replaces the earlier record, and the
    /// running size moves by the difference. Returns the bytes uploaded.
    pub async fn upload_part(
        &self,
        target: &UploadTarget,
        part_number: u32,
        data: Bytes,
        sha1: &str,
        size: u64,
    ) -> Result<u64> {
        if part_number == 0 {
            return Err(TransferError::validation("part numbers start at 1"));
        }
        if data.len() as u64 != size {
            return Err(TransferError::validation(format!(
                "part {} declares {} bytes but carries {}",
                part_number,
                size,
                data.len()
            )));
        }
        self.state.lock().await.ensure_open(&self.file_id)?;

        self.api
            .upload_part(target, part_number, sha1, data)
            .await?;

        let mut state = self.state.lock().await;
        state.ensure_open(&self.file_id)?;
        let record = UploadPartRecord {
            part_number,
            sha1: sha1.to_string(),
            size,
        };
        let replaced = state.parts.insert(part_number, record).map(|old| old.size);
        state.total_size = state.total_size - replaced.unwrap_or(0) + size;

        debug!(
            file_id = %self.file_id,
            part = part_number,
            size,
            replaced = replaced.is_some(),
            total = state.total_size,
            "recorded part"
        );
        Ok(size)
    }

    /// Submit the ordered manifest and finish the file.
    ///
    /// Fails with a validation error, without contacting the service, when
    /// no parts were recorded or the part numbers are not exactly `1..=K`.
    pub async fn finalize(&self) -> Result<RemoteFile> {
        let mut state = self.state.lock().await;
        state.ensure_open(&self.file_id)?;

        let manifest = build_manifest(&state.parts)?;
        debug!(file_id = %self.file_id, parts = manifest.len(), "finishing large file");

        let remote = self
            .api
            .finish_large_file(&self.file_id, &manifest)
            .await?;
        state.status = Status::Finished;

        info!(
            file_id = %self.file_id,
            parts = manifest.len(),
            size = state.total_size,
            "finished large file"
        );
        Ok(RemoteFile {
            size: state.total_size,
            ..remote
        })
    }

    /// Release the remote reservation. Cancelling twice is a no-op.
    pub async fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.status {
            Status::Cancelled => return Ok(()),
            Status::Finished => return state.ensure_open(&self.file_id),
            Status::Open => {}
        }
        self.api.cancel_large_file(&self.file_id).await?;
        state.status = Status::Cancelled;
        info!(file_id = %self.file_id, "cancelled large file");
        Ok(())
    }

    /// Recorded parts in part-number order
    pub async fn parts(&self) -> Vec<UploadPartRecord> {
        self.state.lock().await.parts.values().cloned().collect()
    }

    /// Sum of the sizes of the recorded parts
    pub async fn total_size(&self) -> u64 {
        self.state.lock().await.total_size
    }
}

/// Order part digests by part number, requiring exactly parts `1..=K`
fn build_manifest(parts: &BTreeMap<u32, UploadPartRecord>) -> Result<Vec<String>> {
    if parts.is_empty() {
        return Err(TransferError::validation("no parts have been uploaded"));
    }

    let mut manifest = Vec::with_capacity(parts.len());
    for (position, (&part_number, record)) in parts.iter().enumerate() {
        let expected = position as u32 + 1;
        if part_number != expected {
            return Err(TransferError::validation(format!(
                "part {} is missing (next recorded part is {})",
                expected, part_number
            )));
        }
        manifest.push(record.sha1.clone());
    }
    Ok(manifest)
}
