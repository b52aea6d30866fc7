//! Multipart uploads of large files
//!
//! A [`LargeFileUploadSession`] records parts as they succeed and submits the
//! ordered manifest on `finalize`. [`PartUpload`] bundles a part's bytes with
//! their digest so retries resend exactly the same payload. Files on disk
//! are read one part at a time with [`read_part`].

mod session;

pub use session::LargeFileUploadSession;

use crate::digest::sha1_hex;
use crate::error::{Result, TransferError};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Default size of each part when splitting a payload
pub const DEFAULT_PART_SIZE: u64 = 100_000_000;

/// One part's payload, ready to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUpload {
    /// 1-based part number
    pub part_number: u32,
    pub data: Bytes,
    /// Hex SHA-1 of `data`
    pub sha1: String,
}

impl PartUpload {
    pub fn new(part_number: u32, data: Bytes) -> Self {
        let sha1 = sha1_hex(&data);
        Self {
            part_number,
            data,
            sha1,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Split `data` into parts of `part_size` bytes, numbered from 1.
///
/// The last part holds the remainder. A zero `part_size` yields a single part.
pub fn split_into_parts(data: Bytes, part_size: u64) -> Vec<PartUpload> {
    let part_size = if part_size == 0 {
        data.len().max(1)
    } else {
        usize::try_from(part_size).unwrap_or(usize::MAX)
    };
    let total = data.len();
    (0..total)
        .step_by(part_size)
        .enumerate()
        .map(|(i, start)| {
            let end = start.saturating_add(part_size).min(total);
            PartUpload::new(i as u32 + 1, data.slice(start..end))
        })
        .collect()
}

/// How many parts `total` bytes split into at `part_size`
pub fn part_count(total: u64, part_size: u64) -> u64 {
    match (total, part_size) {
        (0, _) => 0,
        (_, 0) => 1,
        _ => total.div_ceil(part_size),
    }
}

/// Load part `part_number` of the `total`-byte file at `path`, split at
/// `part_size` the same way as [`split_into_parts`]
pub async fn read_part(
    path: &Path,
    part_number: u32,
    part_size: u64,
    total: u64,
) -> Result<PartUpload> {
    if part_number == 0 {
        return Err(TransferError::validation("part numbers start at 1"));
    }
    let part_size = if part_size == 0 { total } else { part_size };
    let offset = u64::from(part_number - 1).saturating_mul(part_size);
    if offset >= total {
        return Err(TransferError::validation(format!(
            "part {} starts at {} beyond the {}-byte file",
            part_number, offset, total
        )));
    }
    let len = usize::try_from(part_size.min(total - offset))
        .map_err(|_| TransferError::validation("part does not fit in memory"))?;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(TransferError::local)?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(TransferError::local)?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .await
        .map_err(TransferError::local)?;
    Ok(PartUpload::new(part_number, Bytes::from(buf)))
}
