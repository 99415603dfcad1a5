//! Legacy per-part HKDF-SHA256 decryption, kept only to read uploads
//! produced by the old format. Each part derives its own independent
//! `(key, iv)` pair and is its own CBC+PKCS#7 unit, unlike the streaming
//! mode where the CBC chain carries across parts.
use hkdf::Hkdf;
use sha2::Sha256;

use crate::aes_stream::{decrypt_whole, BLOCK_SIZE, KEY_SIZE};
use crate::error::EncryptionError;

/// Derives `(key_i, iv_i)` for part `i` of file `file_id`:
/// `HKDF-SHA256(masterKey, salt = nil, info = fileId || littleEndian(i), 48 bytes)`,
/// split into a 32-byte key followed by a 16-byte IV.
pub fn derive_part_key_iv(
    master_key: &[u8],
    file_id: &str,
    part_index: u64,
) -> Result<([u8; KEY_SIZE], [u8; BLOCK_SIZE]), EncryptionError> {
    let hk = Hkdf::<Sha256>::new(None, master_key);
    let mut info = file_id.as_bytes().to_vec();
    info.extend_from_slice(&part_index.to_le_bytes());

    let mut okm = [0u8; KEY_SIZE + BLOCK_SIZE];
    hk.expand(&info, &mut okm)
        .map_err(|_| EncryptionError::InvalidKeyLength(master_key.len()))?;

    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; BLOCK_SIZE];
    key.copy_from_slice(&okm[..KEY_SIZE]);
    iv.copy_from_slice(&okm[KEY_SIZE..]);
    Ok((key, iv))
}

/// Decrypts one independently-encrypted legacy part.
pub fn decrypt_legacy_part(
    master_key: &[u8],
    file_id: &str,
    part_index: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let (key, iv) = derive_part_key_iv(master_key, file_id, part_index)?;
    decrypt_whole(&key, &iv, ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aes_stream::StreamingEncryptor;

    #[test]
    fn derive_is_deterministic_and_varies_by_part_index() {
        let master = [3u8; 32];
        let (k0, iv0) = derive_part_key_iv(&master, "file-1", 0).unwrap();
        let (k0_again, iv0_again) = derive_part_key_iv(&master, "file-1", 0).unwrap();
        let (k1, iv1) = derive_part_key_iv(&master, "file-1", 1).unwrap();

        assert_eq!(k0, k0_again);
        assert_eq!(iv0, iv0_again);
        assert_ne!(k0, k1);
        assert_ne!(iv0, iv1);
    }

    #[test]
    fn decrypt_legacy_part_round_trips_with_derived_key() {
        let master = [5u8; 32];
        let (key, iv) = derive_part_key_iv(&master, "file-42", 3).unwrap();
        let mut encryptor = StreamingEncryptor::new(&key, &iv).unwrap();
        let ciphertext = encryptor.encrypt_part(b"legacy part payload", true).unwrap();

        let decrypted = decrypt_legacy_part(&master, "file-42", 3, &ciphertext).unwrap();
        assert_eq!(decrypted, b"legacy part payload");
    }

    #[test]
    fn decrypt_legacy_part_fails_with_wrong_part_index() {
        let master = [5u8; 32];
        let (key, iv) = derive_part_key_iv(&master, "file-42", 3).unwrap();
        let mut encryptor = StreamingEncryptor::new(&key, &iv).unwrap();
        let ciphertext = encryptor.encrypt_part(b"legacy part payload", true).unwrap();

        assert!(decrypt_legacy_part(&master, "file-42", 4, &ciphertext).is_err());
    }
}
