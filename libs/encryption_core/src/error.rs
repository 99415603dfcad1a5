#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    /// A non-final call to `encrypt_part`/`decrypt_part` was given a buffer
    /// whose length is not a whole multiple of the AES block size.
    #[error("non-final part length {0} is not a multiple of the AES block size (16)")]
    InvariantError(usize),
    #[error("PKCS#7 unpadding failed: ciphertext is corrupt or the key/IV is wrong")]
    Unpad,
    #[error("key must be exactly 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("IV must be exactly 16 bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("hash algorithm {0} is not implemented")]
    UnimplementedHash(String),
}
