use bytes::Bytes;
use skyhaul::error::{CancelReason, ProtocolError, TransferError};
use skyhaul::recovery::{BackoffStrategy, Operation, RetryPolicy};
use skyhaul::remote::memory::{connection_reset, MemoryRemote};
use skyhaul::remote::{LargeFileApi, StartLargeFile};
use skyhaul::{DownloadOptions, LargeFileUploadSession, PartUpload, TransferOrchestrator};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff: BackoffStrategy::Fixed,
        jitter_factor: 0.0,
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn server_error(operation: Operation, status: u16) -> TransferError {
    ProtocolError::new(operation, status, "scripted failure").into()
}

fn params(name: &str) -> StartLargeFile {
    StartLargeFile {
        bucket_id: "bucket-1".to_string(),
        name: name.to_string(),
        content_type: "b2/x-auto".to_string(),
        ..Default::default()
    }
}

async fn open(remote: &Arc<MemoryRemote>) -> LargeFileUploadSession {
    let api: Arc<dyn LargeFileApi> = remote.clone();
    LargeFileUploadSession::start(api, &params("file.bin"))
        .await
        .unwrap()
}

/// Takes `accept` bytes, fails one write, then takes everything
struct HiccupSink {
    data: Vec<u8>,
    accept: usize,
    failed: bool,
}

impl HiccupSink {
    fn new(accept: usize) -> Self {
        Self {
            data: Vec::new(),
            accept,
            failed: false,
        }
    }
}

impl AsyncWrite for HiccupSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.failed {
            self.data.extend_from_slice(buf);
            return Poll::Ready(Ok(buf.len()));
        }
        let room = self.accept - self.data.len();
        if room == 0 {
            self.failed = true;
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk hiccup")));
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

fn count_at(remote: &MemoryRemote, offset: u64) -> usize {
    remote
        .range_requests()
        .iter()
        .filter(|(o, _)| *o == offset)
        .count()
}

#[tokio::test]
async fn test_download_resumes_after_transport_failure() {
    let data = payload(100);
    let remote = Arc::new(MemoryRemote::new());
    let object = remote.put_object("bucket", "obj", data.clone());
    remote.fail_range_at(40, connection_reset());

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let options = DownloadOptions {
        chunk_size: 10,
        concurrency: 2,
    };
    let mut sink = Vec::new();
    let written = orchestrator
        .download(remote.clone(), &object, options, &mut sink)
        .await
        .unwrap();

    assert_eq!(written, 100);
    assert_eq!(sink, data);
    assert_eq!(count_at(&remote, 40), 2);
    // The retry never starts over from the beginning
    assert_eq!(count_at(&remote, 0), 1);
}

#[tokio::test]
async fn test_sink_failure_is_not_retried_or_duplicated() {
    let data = payload(100);
    let remote = Arc::new(MemoryRemote::new());
    let object = remote.put_object("bucket", "obj", data.clone());

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let options = DownloadOptions {
        chunk_size: 50,
        concurrency: 1,
    };
    let mut sink = HiccupSink::new(30);
    let err = orchestrator
        .download(remote.clone(), &object, options, &mut sink)
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Local { .. }));
    assert_eq!(sink.data, &data[..30]);
    assert_eq!(count_at(&remote, 0), 1);
}

#[tokio::test]
async fn test_download_does_not_retry_missing_object() {
    let remote = Arc::new(MemoryRemote::new());
    let object = skyhaul::remote::RemoteObjectHandle::new("bucket", "ghost", 50);

    let orchestrator = TransferOrchestrator::new(fast_policy(5));
    let mut sink = Vec::new();
    let err = orchestrator
        .download(remote.clone(), &object, DownloadOptions::default(), &mut sink)
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(404));
    assert_eq!(remote.range_requests().len(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let remote = Arc::new(MemoryRemote::new());
    let object = remote.put_object("bucket", "busy", payload(30));
    for _ in 0..3 {
        remote.fail_range_at(0, server_error(Operation::DownloadFileByName, 503));
    }

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let mut sink = Vec::new();
    let err = orchestrator
        .download(remote.clone(), &object, DownloadOptions::default(), &mut sink)
        .await
        .unwrap_err();

    assert_eq!(err, server_error(Operation::DownloadFileByName, 503));
    assert_eq!(count_at(&remote, 0), 3);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn test_server_error_on_part_acquires_new_target() {
    let remote = Arc::new(MemoryRemote::new());
    let session = open(&remote).await;
    remote.fail_next(Operation::UploadPart, server_error(Operation::UploadPart, 500));

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let part = PartUpload::new(1, Bytes::from_static(b"hello part"));
    let size = orchestrator.upload_part(&session, &part).await.unwrap();

    assert_eq!(size, 10);
    assert_eq!(remote.targets_issued(), 2);
    assert_eq!(remote.stored_parts(session.file_id()), 1);
}

#[tokio::test]
async fn test_expired_token_triggers_reauthentication() {
    let remote = Arc::new(MemoryRemote::new());
    let session = open(&remote).await;
    remote.expire_auth();

    let orchestrator = TransferOrchestrator::new(fast_policy(3))
        .with_reauthenticator(remote.clone());
    let part = PartUpload::new(1, Bytes::from_static(b"data"));
    orchestrator.upload_part(&session, &part).await.unwrap();

    assert_eq!(remote.reauth_count(), 1);
    assert_eq!(remote.stored_parts(session.file_id()), 1);
}

#[tokio::test]
async fn test_expired_token_without_reauthenticator_fails() {
    let remote = Arc::new(MemoryRemote::new());
    let session = open(&remote).await;
    remote.expire_auth();

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let part = PartUpload::new(1, Bytes::from_static(b"data"));
    let err = orchestrator.upload_part(&session, &part).await.unwrap_err();

    assert_eq!(err.status(), Some(401));
    assert_eq!(remote.reauth_count(), 0);
}

#[tokio::test]
async fn test_transport_retry_can_be_disabled() {
    let remote = Arc::new(MemoryRemote::new());
    let session = open(&remote).await;
    let part = PartUpload::new(1, Bytes::from_static(b"payload"));

    remote.fail_next(Operation::UploadPart, connection_reset());
    let strict = TransferOrchestrator::new(fast_policy(3)).retry_transport_errors(false);
    let err = strict.upload_part(&session, &part).await.unwrap_err();
    assert!(err.is_transport());

    remote.fail_next(Operation::UploadPart, connection_reset());
    let lenient = TransferOrchestrator::new(fast_policy(3));
    assert_eq!(lenient.upload_part(&session, &part).await.unwrap(), 7);
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let remote = Arc::new(MemoryRemote::new());
    let session = open(&remote).await;

    let orchestrator = TransferOrchestrator::new(fast_policy(5));
    let part = PartUpload::new(0, Bytes::from_static(b"zero"));
    let err = orchestrator.upload_part(&session, &part).await.unwrap_err();

    assert!(matches!(err, TransferError::Validation(_)));
    assert_eq!(remote.targets_issued(), 1);
}

#[tokio::test]
async fn test_finalize_does_not_retry_transport_errors() {
    let remote = Arc::new(MemoryRemote::new());
    let session = open(&remote).await;
    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let part = PartUpload::new(1, Bytes::from_static(b"only part"));
    orchestrator.upload_part(&session, &part).await.unwrap();

    remote.fail_next(Operation::FinishLargeFile, connection_reset());
    let err = orchestrator.finalize(&session).await.unwrap_err();
    assert!(err.is_transport());

    let file = orchestrator.finalize(&session).await.unwrap();
    assert_eq!(file.size, 9);
}

#[tokio::test]
async fn test_full_upload_assembles_object() {
    let data = payload(1_000);
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(Operation::UploadPart, server_error(Operation::UploadPart, 503));

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let file = orchestrator
        .upload(remote.clone(), &params("big.bin"), Bytes::from(data.clone()), 300, 3)
        .await
        .unwrap();

    assert_eq!(file.size, 1_000);
    assert_eq!(remote.get_object("bucket-1", "big.bin").unwrap(), data);
    let manifests = remote.submitted_manifests();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0].len(), 4);
    assert_eq!(remote.cancel_count(), 0);
}

#[tokio::test]
async fn test_file_upload_reads_parts_from_disk() {
    let data = payload(1_000);
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), &data).unwrap();

    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(Operation::UploadPart, server_error(Operation::UploadPart, 503));

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let uploaded = orchestrator
        .upload_file(remote.clone(), &params("disk.bin"), file.path(), 300, 2)
        .await
        .unwrap();

    assert_eq!(uploaded.size, 1_000);
    assert_eq!(remote.get_object("bucket-1", "disk.bin").unwrap(), data);
    let expected: Vec<String> = data.chunks(300).map(skyhaul::digest::sha1_hex).collect();
    assert_eq!(remote.submitted_manifests(), vec![expected]);
}

#[tokio::test]
async fn test_missing_source_file_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemote::new());

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let err = orchestrator
        .upload_file(remote.clone(), &params("ghost"), &dir.path().join("nope"), 300, 2)
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Local { .. }));
    assert_eq!(remote.targets_issued(), 0);
    assert_eq!(remote.cancel_count(), 0);
}

#[tokio::test]
async fn test_failed_upload_cancels_large_file() {
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(Operation::UploadPart, server_error(Operation::UploadPart, 400));

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let err = orchestrator
        .upload(remote.clone(), &params("doomed"), Bytes::from(payload(50)), 20, 1)
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(400));
    assert_eq!(remote.cancel_count(), 1);
    assert!(remote.submitted_manifests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_server_retry_after_is_honoured() {
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(
        Operation::StartLargeFile,
        ProtocolError::new(Operation::StartLargeFile, 503, "slow down")
            .with_retry_after(Duration::from_secs(2))
            .into(),
    );

    let orchestrator = TransferOrchestrator::new(fast_policy(3));
    let started = tokio::time::Instant::now();
    orchestrator
        .upload(remote.clone(), &params("patient"), Bytes::from_static(b"abc"), 10, 1)
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_cancellation_interrupts_backoff() {
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next(
        Operation::StartLargeFile,
        server_error(Operation::StartLargeFile, 503),
    );

    let token = CancellationToken::new();
    let policy = RetryPolicy {
        initial_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(60),
        ..fast_policy(3)
    };
    let orchestrator = TransferOrchestrator::new(policy).with_cancellation(&token);

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.upload(remote.clone(), &params("never"), Bytes::from_static(b"x"), 10, 1),
    )
    .await
    .expect("backoff ignored cancellation")
    .unwrap_err();
    assert_eq!(err, TransferError::Cancelled(CancelReason::Caller));
}
