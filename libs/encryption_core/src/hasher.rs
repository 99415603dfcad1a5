//! Incremental SHA-512 used to hash a file's plaintext as it streams past,
//! so hashing overlaps the network transfer instead of requiring a second
//! full read afterward.
use sha2::{Digest, Sha512};

#[derive(Default)]
pub struct StreamingSha512 {
    hasher: Sha512,
}

impl StreamingSha512 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Consumes the hasher and returns the lowercase hex digest, the form
    /// declared checksums are compared against.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// One-shot helper for callers that already hold the whole buffer (pre-flight
/// hash of a small file, or checksum verification re-reads).
pub fn sha512_hex(data: &[u8]) -> String {
    let mut hasher = StreamingSha512::new();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Case-insensitive comparison, matching how declared checksums from the
/// platform API are compared against the computed digest.
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
