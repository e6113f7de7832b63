// SHA-256 content digests, hex encoded as they travel in X-Filehash

use sha2::{Digest, Sha256};

/// Hex digest of a complete buffer.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental digest for bodies that are streamed in chunks.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Sha256,
    len: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    /// Compare against a digest received from the peer; case-insensitive.
    pub fn matches(self, expected: &str) -> bool {
        self.finalize().eq_ignore_ascii_case(expected.trim())
    }
}
