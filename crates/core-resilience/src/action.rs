//! Retry actions: what a caller should do after a remote call fails
//!
//! Classification is pure. It looks only at the HTTP status, the server's
//! `Retry-After` hint and the remote operation that failed, so the same rules
//! apply to downloads, part uploads and manifest submission alike.
//!
//! # Example
//!
//! ```
//! use skyhaul_core_resilience::action::{classify_status, Operation, RetryAction};
//! use std::time::Duration;
//!
//! assert_eq!(
//!     classify_status(500, None, Operation::UploadPart),
//!     RetryAction::AcquireNewUploadTarget
//! );
//! assert_eq!(
//!     classify_status(503, Some(Duration::from_secs(30)), Operation::DownloadFileByName),
//!     RetryAction::RetryAfter(Duration::from_secs(30))
//! );
//! assert_eq!(
//!     classify_status(401, None, Operation::AuthorizeAccount),
//!     RetryAction::Abort
//! );
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Remote operations issued by the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    AuthorizeAccount,
    ListBuckets,
    GetUploadUrl,
    UploadFile,
    StartLargeFile,
    GetUploadPartUrl,
    UploadPart,
    FinishLargeFile,
    CancelLargeFile,
    DownloadFileByName,
}

impl Operation {
    /// All operations, in declaration order
    pub const ALL: [Operation; 10] = [
        Operation::AuthorizeAccount,
        Operation::ListBuckets,
        Operation::GetUploadUrl,
        Operation::UploadFile,
        Operation::StartLargeFile,
        Operation::GetUploadPartUrl,
        Operation::UploadPart,
        Operation::FinishLargeFile,
        Operation::CancelLargeFile,
        Operation::DownloadFileByName,
    ];

    /// Wire name of the operation (the native API method name)
    pub fn api_name(&self) -> &'static str {
        match self {
            Operation::AuthorizeAccount => "b2_authorize_account",
            Operation::ListBuckets => "b2_list_buckets",
            Operation::GetUploadUrl => "b2_get_upload_url",
            Operation::UploadFile => "b2_upload_file",
            Operation::StartLargeFile => "b2_start_large_file",
            Operation::GetUploadPartUrl => "b2_get_upload_part_url",
            Operation::UploadPart => "b2_upload_part",
            Operation::FinishLargeFile => "b2_finish_large_file",
            Operation::CancelLargeFile => "b2_cancel_large_file",
            Operation::DownloadFileByName => "b2_download_file_by_name",
        }
    }

    /// Short name used in logs and on the command line
    pub fn short_name(&self) -> &'static str {
        match self {
            Operation::AuthorizeAccount => "authorize",
            Operation::ListBuckets => "list_buckets",
            Operation::GetUploadUrl => "get_upload_url",
            Operation::UploadFile => "upload_file",
            Operation::StartLargeFile => "start_large_file",
            Operation::GetUploadPartUrl => "get_upload_part_url",
            Operation::UploadPart => "upload_part",
            Operation::FinishLargeFile => "finish_large_file",
            Operation::CancelLargeFile => "cancel_large_file",
            Operation::DownloadFileByName => "download_file_by_name",
        }
    }

    /// True for operations that push object bytes to an upload target
    pub fn is_upload(&self) -> bool {
        matches!(self, Operation::UploadFile | Operation::UploadPart)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// Returned when an operation name is not recognised
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    /// Accepts either the short name (`upload_part`) or the API name (`b2_upload_part`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed.strip_prefix("b2_").unwrap_or(trimmed);
        let bare = if bare == "authorize_account" {
            "authorize"
        } else {
            bare
        };
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.short_name() == bare)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// What the caller should do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Account token expired; authorize again and retry
    ReAuthenticate,

    /// The upload URL or its token is no longer usable; fetch a new upload target
    AcquireNewUploadTarget,

    /// Wait and retry. A zero duration means the server gave no hint and the
    /// caller applies its own backoff.
    RetryAfter(Duration),

    /// Nothing useful to do; surface the error
    Abort,
}

impl RetryAction {
    /// True for every action other than `Abort`
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RetryAction::Abort)
    }
}

impl fmt::Display for RetryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryAction::ReAuthenticate => write!(f, "reauthenticate"),
            RetryAction::AcquireNewUploadTarget => write!(f, "acquire new upload target"),
            RetryAction::RetryAfter(d) if d.is_zero() => write!(f, "retry with backoff"),
            RetryAction::RetryAfter(d) => write!(f, "retry after {}s", d.as_secs()),
            RetryAction::Abort => write!(f, "abort"),
        }
    }
}

/// Classify a protocol failure.
///
/// Rules, first match wins:
/// 1. a non-zero server `retry_after` means `RetryAfter(retry_after)`;
/// 2. a 5xx on an upload means `AcquireNewUploadTarget`;
/// 3. 401 means `ReAuthenticate`, unless authorization itself failed (`Abort`);
/// 4. 429, 500 and 503 mean `RetryAfter(0)`;
/// 5. anything else is `Abort`.
pub fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    operation: Operation,
) -> RetryAction {
    if let Some(wait) = retry_after.filter(|d| !d.is_zero()) {
        return RetryAction::RetryAfter(wait);
    }

    if (500..600).contains(&status) && operation.is_upload() {
        return RetryAction::AcquireNewUploadTarget;
    }

    match status {
        401 if operation == Operation::AuthorizeAccount => RetryAction::Abort,
        401 => RetryAction::ReAuthenticate,
        429 | 500 | 503 => RetryAction::RetryAfter(Duration::ZERO),
        _ => RetryAction::Abort,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_wins_over_status() {
        let wait = Duration::from_secs(30);
        assert_eq!(
            classify_status(503, Some(wait), Operation::GetUploadUrl),
            RetryAction::RetryAfter(wait)
        );
        // Even a 401 honours an explicit wait
        assert_eq!(
            classify_status(401, Some(wait), Operation::UploadPart),
            RetryAction::RetryAfter(wait)
        );
    }

    #[test]
    fn test_zero_retry_after_is_ignored() {
        assert_eq!(
            classify_status(503, Some(Duration::ZERO), Operation::FinishLargeFile),
            RetryAction::RetryAfter(Duration::ZERO)
        );
    }

    #[test]
    fn test_server_errors_on_upload_need_new_target() {
        for status in [500, 502, 503, 599] {
            assert_eq!(
                classify_status(status, None, Operation::UploadPart),
                RetryAction::AcquireNewUploadTarget
            );
            assert_eq!(
                classify_status(status, None, Operation::UploadFile),
                RetryAction::AcquireNewUploadTarget
            );
        }
    }

    #[test]
    fn test_unauthorized() {
        assert_eq!(
            classify_status(401, None, Operation::AuthorizeAccount),
            RetryAction::Abort
        );
        assert_eq!(
            classify_status(401, None, Operation::UploadPart),
            RetryAction::ReAuthenticate
        );
        assert_eq!(
            classify_status(401, None, Operation::DownloadFileByName),
            RetryAction::ReAuthenticate
        );
    }

    #[test]
    fn test_backoff_statuses() {
        for status in [429, 500, 503] {
            assert_eq!(
                classify_status(status, None, Operation::DownloadFileByName),
                RetryAction::RetryAfter(Duration::ZERO)
            );
        }
        // 502 outside of uploads is not in the retry set
        assert_eq!(
            classify_status(502, None, Operation::DownloadFileByName),
            RetryAction::Abort
        );
    }

    #[test]
    fn test_client_errors_abort() {
        for status in [400, 403, 404, 416] {
            assert_eq!(
                classify_status(status, None, Operation::UploadPart),
                RetryAction::Abort
            );
        }
    }

    #[test]
    fn test_operation_parsing() {
        assert_eq!("upload_part".parse::<Operation>(), Ok(Operation::UploadPart));
        assert_eq!("b2_upload_part".parse::<Operation>(), Ok(Operation::UploadPart));
        assert_eq!("authorize".parse::<Operation>(), Ok(Operation::AuthorizeAccount));
        assert_eq!("b2_authorize_account".parse::<Operation>(), Ok(Operation::AuthorizeAccount));
        assert!("b2_delete_bucket".parse::<Operation>().is_err());

        for op in Operation::ALL {
            assert_eq!(op.short_name().parse::<Operation>(), Ok(op));
            assert_eq!(op.api_name().parse::<Operation>(), Ok(op));
        }
    }

    #[test]
    fn test_action_display() {
        assert_eq!(
            RetryAction::RetryAfter(Duration::ZERO).to_string(),
            "retry with backoff"
        );
        assert_eq!(
            RetryAction::RetryAfter(Duration::from_secs(7)).to_string(),
            "retry after 7s"
        );
        assert!(!RetryAction::Abort.is_retryable());
        assert!(RetryAction::ReAuthenticate.is_retryable());
    }
}
