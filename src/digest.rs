/*!
 * Content digests for part manifests
 *
 * The service identifies each uploaded part by the lowercase hex SHA-1 of its bytes.
 */

use sha1::{Digest, Sha1};

/// Hex-encoded SHA-1 of `data`
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Incremental SHA-1 for data that arrives in pieces
#[derive(Default, Clone)]
pub struct Sha1Hasher {
    inner: Sha1,
}

impl Sha1Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}
