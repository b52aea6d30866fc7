//! Skyhaul Core Resilience: pure-logic failure handling for object transfers
//!
//! # Overview
//!
//! This crate turns a failed remote call into a decision. It includes:
//!
//! - **Operations**: the closed set of remote calls the transfer engine issues
//! - **Retry actions**: reauthenticate, acquire a new upload target, back off
//!   and retry, or abort
//! - **Backoff policy**: exponential backoff with jitter, capped, with a
//!   one-second floor when the server gives no hint
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - HTTP clients or async runtimes
//! - Buffers, readers or upload sessions
//!
//! The transfer crate maps its own error type onto [`action::classify_status`].
//!
//! # Usage Example
//!
//! ```
//! use skyhaul_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! let action = classify_status(429, None, Operation::DownloadFileByName);
//!
//! if let RetryAction::RetryAfter(hint) = action {
//!     let wait = policy.delay_for(1, hint);
//!     assert!(wait >= Duration::from_secs(1));
//! }
//! ```

pub mod action;
pub mod backoff;

// Re-export main types for convenience
pub use action::{classify_status, Operation, RetryAction, UnknownOperation};
pub use backoff::{BackoffStrategy, RetryPolicy};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::action::{classify_status, Operation, RetryAction};
    pub use super::backoff::{BackoffStrategy, RetryPolicy};
}
