/*!
 * Skyhaul - parallel transfers for cloud object storage
 *
 * A client-side transfer engine with:
 * - Chunked parallel downloads delivered as one in-order byte stream
 * - Multipart uploads with an ordered part manifest
 * - Classification of failures into recovery actions
 * - Retry orchestration with exponential backoff and reauthentication
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod config;
pub mod digest;
pub mod download;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod recovery;
pub mod remote;
pub mod upload;

mod util;

// Re-export commonly used types
pub use config::TransferConfig;
pub use download::{ChunkedDownloadReader, DownloadOptions};
pub use error::{Result, TransferError};
pub use orchestrator::TransferOrchestrator;
pub use recovery::{classify, RetryAction};
pub use upload::{LargeFileUploadSession, PartUpload};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
