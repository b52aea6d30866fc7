/*!
 * Retry policy around downloads and multipart uploads
 *
 * Readers and upload sessions never retry on their own. The orchestrator
 * classifies each failure and decides whether to wait and retry, get a new
 * upload target, reauthenticate, or give up. When it gives up, the error
 * from the last attempt is returned unchanged.
 */

use crate::config::TransferConfig;
use crate::download::{ChunkedDownloadReader, DownloadOptions};
use crate::error::{CancelReason, Result, TransferError};
use crate::recovery::{classify, RetryAction, RetryPolicy};
use crate::remote::{
    LargeFileApi, ObjectSource, Reauthenticate, RemoteFile, RemoteObjectHandle, StartLargeFile,
    UploadTarget,
};
use crate::upload::{part_count, read_part, split_into_parts, LargeFileUploadSession, PartUpload};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Wait(Duration),
    NewTarget,
    Reauthenticate,
}

/// Caller-facing retry layer
pub struct TransferOrchestrator {
    policy: RetryPolicy,
    retry_transport_errors: bool,
    reauth: Option<Arc<dyn Reauthenticate>>,
    cancel: CancellationToken,
}

impl TransferOrchestrator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_transport_errors: true,
            reauth: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Build from the `[retry]` section of a configuration
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.retry.policy())
            .retry_transport_errors(config.retry.retry_transport_errors)
    }

    /// Use `reauth` to refresh the session after a 401
    pub fn with_reauthenticator(mut self, reauth: Arc<dyn Reauthenticate>) -> Self {
        self.reauth = Some(reauth);
        self
    }

    /// Whether transport failures are retried with backoff
    pub fn retry_transport_errors(mut self, enabled: bool) -> Self {
        self.retry_transport_errors = enabled;
        self
    }

    /// Stop every transfer and backoff wait when `token` fires
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the next step after attempt number `attempt` failed with `err`
    fn next_step(&self, err: &TransferError, attempt: u32, retry_transport: bool) -> Option<Step> {
        // Local sink and source failures end the transfer at once
        if err.is_cancelled() || err.is_local() || !self.policy.allows_another(attempt) {
            return None;
        }
        match classify(err) {
            RetryAction::RetryAfter(hint) => Some(Step::Wait(self.policy.delay_for(attempt, hint))),
            RetryAction::AcquireNewUploadTarget => Some(Step::NewTarget),
            RetryAction::ReAuthenticate if self.reauth.is_some() => Some(Step::Reauthenticate),
            RetryAction::ReAuthenticate => None,
            RetryAction::Abort if retry_transport && err.is_transport() => {
                Some(Step::Wait(self.policy.calculate_delay(attempt)))
            }
            RetryAction::Abort => None,
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled(CancelReason::Caller)),
        }
    }

    async fn reauthenticate(&self) -> Result<()> {
        match &self.reauth {
            Some(reauth) => {
                info!("reauthenticating after expired token");
                reauth.reauthenticate().await
            }
            None => Ok(()),
        }
    }

    /// Retry a single call that has no upload target to replace
    async fn retry_call<F, Fut, T>(
        &self,
        what: &str,
        retry_transport: bool,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let Some(step) = self.next_step(&err, attempt, retry_transport) else {
                return Err(err);
            };
            warn!(what, attempt, step = ?step, error = %err, "retrying");
            match step {
                Step::Wait(delay) => self.pause(delay).await?,
                Step::NewTarget => self.pause(self.policy.calculate_delay(attempt)).await?,
                Step::Reauthenticate => self.reauthenticate().await?,
            }
        }
    }

    /// Copy a whole object into `sink`, returning the bytes written.
    ///
    /// A retry starts a fresh reader at the first byte not yet written.
    pub async fn download<W>(
        &self,
        source: Arc<dyn ObjectSource>,
        object: &RemoteObjectHandle,
        options: DownloadOptions,
        sink: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut offset = 0;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut reader =
                ChunkedDownloadReader::new(Arc::clone(&source), object.clone(), options)
                    .starting_at(offset)
                    .with_cancellation(&self.cancel);
            let result = reader.copy_to(sink).await;
            offset = reader.position();
            reader.close();

            let err = match result {
                Ok(_) => {
                    debug!(object = %object, attempts = attempt, "download finished");
                    return Ok(object.size);
                }
                Err(err) => err,
            };
            let Some(step) = self.next_step(&err, attempt, self.retry_transport_errors) else {
                return Err(err);
            };
            warn!(
                object = %object,
                attempt,
                offset,
                step = ?step,
                error = %err,
                "download attempt failed"
            );
            match step {
                Step::Wait(delay) => self.pause(delay).await?,
                Step::NewTarget => self.pause(self.policy.calculate_delay(attempt)).await?,
                Step::Reauthenticate => self.reauthenticate().await?,
            }
        }
    }

    async fn acquire_target(&self, session: &LargeFileUploadSession) -> Result<UploadTarget> {
        self.retry_call("get upload target", self.retry_transport_errors, move || {
            session.acquire_upload_target()
        })
        .await
    }

    /// Upload one part, replacing the target or reauthenticating as needed
    pub async fn upload_part(
        &self,
        session: &LargeFileUploadSession,
        part: &PartUpload,
    ) -> Result<u64> {
        let mut target = self.acquire_target(session).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = session
                .upload_part(
                    &target,
                    part.part_number,
                    part.data.clone(),
                    &part.sha1,
                    part.size(),
                )
                .await;
            let err = match result {
                Ok(size) => return Ok(size),
                Err(err) => err,
            };
            let Some(step) = self.next_step(&err, attempt, self.retry_transport_errors) else {
                return Err(err);
            };
            warn!(
                file_id = session.file_id(),
                part = part.part_number,
                attempt,
                step = ?step,
                error = %err,
                "part upload failed"
            );
            match step {
                Step::Wait(delay) => self.pause(delay).await?,
                Step::NewTarget => target = self.acquire_target(session).await?,
                Step::Reauthenticate => {
                    self.reauthenticate().await?;
                    target = self.acquire_target(session).await?;
                }
            }
        }
    }

    /// Upload parts with up to `concurrency` in flight, each on its own target.
    ///
    /// Stops at the first part that fails for good. Returns the bytes uploaded.
    pub async fn upload_parts(
        &self,
        session: &LargeFileUploadSession,
        parts: &[PartUpload],
        concurrency: usize,
    ) -> Result<u64> {
        futures::stream::iter(parts)
            .map(|part| self.upload_part(session, part))
            .buffer_unordered(concurrency.max(1))
            .try_fold(0u64, |total, size| async move { Ok(total + size) })
            .await
    }

    /// Finish the session, retrying only throttling and expired tokens
    pub async fn finalize(&self, session: &LargeFileUploadSession) -> Result<RemoteFile> {
        self.retry_call("finish large file", false, move || session.finalize())
            .await
    }

    /// Upload `data` as a large file: start, upload every part, finish.
    ///
    /// The large file is cancelled if any step fails.
    pub async fn upload(
        &self,
        api: Arc<dyn LargeFileApi>,
        params: &StartLargeFile,
        data: Bytes,
        part_size: u64,
        concurrency: usize,
    ) -> Result<RemoteFile> {
        let session = self.start(api, params).await?;
        let parts = split_into_parts(data, part_size);
        let uploaded = self.upload_parts(&session, &parts, concurrency).await;
        self.finish_or_cancel(&session, uploaded).await
    }

    /// Upload the file at `path` as a large file.
    ///
    /// Parts are read from disk only when their upload starts, so at most
    /// `concurrency` parts are held in memory.
    pub async fn upload_file(
        &self,
        api: Arc<dyn LargeFileApi>,
        params: &StartLargeFile,
        path: &Path,
        part_size: u64,
        concurrency: usize,
    ) -> Result<RemoteFile> {
        let total = tokio::fs::metadata(path)
            .await
            .map_err(TransferError::local)?
            .len();
        let count = part_count(total, part_size);
        let last = u32::try_from(count)
            .map_err(|_| TransferError::validation(format!("{} parts is too many", count)))?;
        debug!(path = %path.display(), total, part_size, parts = count, "uploading file");

        let session = self.start(api, params).await?;
        let uploaded = {
            let session = &session;
            futures::stream::iter(1..=last)
                .map(move |part_number| async move {
                    let part = read_part(path, part_number, part_size, total).await?;
                    self.upload_part(session, &part).await
                })
                .buffer_unordered(concurrency.max(1))
                .try_fold(0u64, |sum, size| async move { Ok(sum + size) })
                .await
        };
        self.finish_or_cancel(&session, uploaded).await
    }

    async fn start(
        &self,
        api: Arc<dyn LargeFileApi>,
        params: &StartLargeFile,
    ) -> Result<LargeFileUploadSession> {
        self.retry_call("start large file", self.retry_transport_errors, move || {
            LargeFileUploadSession::start(Arc::clone(&api), params)
        })
        .await
    }

    /// Finalize after a successful part phase; cancel the large file on any failure
    async fn finish_or_cancel(
        &self,
        session: &LargeFileUploadSession,
        uploaded: Result<u64>,
    ) -> Result<RemoteFile> {
        let result = match uploaded {
            Ok(_) => self.finalize(session).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            if let Err(cancel_err) = session.cancel().await {
                warn!(
                    file_id = session.file_id(),
                    error = %cancel_err,
                    "failed to cancel large file"
                );
            }
        }
        result
    }
}
