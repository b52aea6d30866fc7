/*!
 * Classification of transfer failures into recovery actions
 *
 * Only protocol errors carry enough detail to classify. Transport failures,
 * validation failures and cancellation all classify as `Abort`; callers that
 * want to retry transport errors decide that for themselves.
 */

use crate::error::TransferError;
use std::time::Duration;

pub use skyhaul_core_resilience::{
    classify_status, BackoffStrategy, Operation, RetryAction, RetryPolicy,
};

/// Decide how a caller should react to `err`
pub fn classify(err: &TransferError) -> RetryAction {
    match err {
        TransferError::Protocol(e) => classify_status(e.status, e.retry_after, e.operation),
        _ => RetryAction::Abort,
    }
}

/// Server-supplied wait carried by `err`, or zero
pub fn backoff(err: &TransferError) -> Duration {
    err.retry_after().unwrap_or(Duration::ZERO)
}
