//! AES-256-CBC streaming (and legacy HKDF) encryption primitives plus
//! incremental SHA-512 hashing. Operates purely on caller-provided buffers
//! — this crate never touches the filesystem or network, matching how the
//! teacher keeps its codecs (e.g. `postgres_ffi`'s WAL record parsing) free
//! of I/O so they stay unit-testable without a runtime.
#![deny(unsafe_code)]

pub mod aes_stream;
pub mod error;
pub mod hasher;
pub mod hkdf_legacy;

pub use aes_stream::{
    decrypt_whole, encrypt_whole, from_base64, to_base64, StreamingDecryptor, StreamingEncryptor,
    BLOCK_SIZE, KEY_SIZE,
};
pub use error::EncryptionError;
pub use hasher::{hashes_match, sha512_hex, StreamingSha512};
pub use hkdf_legacy::{decrypt_legacy_part, derive_part_key_iv};
