//! Streaming AES-256-CBC with the CBC chain carried across parts, grounded
//! on the decrypt half the teacher's `fivetran_destination::aes` module
//! builds (`cbc::Decryptor<aes::Aes256Dec>` + `BlockDecryptMut` +
//! `decrypt_padded_mut::<Pkcs7>`), extended here with the matching
//! encryptor and made resumable via an explicit current-IV cursor.
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::EncryptionError;

pub fn to_base64(bytes: &[u8]) -> String {
    base64::encode(bytes)
}

pub fn from_base64(s: &str) -> Result<Vec<u8>, EncryptionError> {
    base64::decode(s).map_err(|_| EncryptionError::InvalidKeyLength(0))
}

pub const KEY_SIZE: usize = 32;
pub const BLOCK_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256Dec>;

fn check_key(key: &[u8]) -> Result<(), EncryptionError> {
    if key.len() != KEY_SIZE {
        return Err(EncryptionError::InvalidKeyLength(key.len()));
    }
    Ok(())
}

fn check_iv(iv: &[u8]) -> Result<(), EncryptionError> {
    if iv.len() != BLOCK_SIZE {
        return Err(EncryptionError::InvalidIvLength(iv.len()));
    }
    Ok(())
}

/// Encrypts a file's parts in order, carrying the CBC chain across part
/// boundaries: part *k*'s IV is the last ciphertext block of part *k-1*,
/// part 0 uses `initial_iv`. Only the part passed with `is_final = true`
/// receives PKCS#7 padding.
pub struct StreamingEncryptor {
    key: [u8; KEY_SIZE],
    initial_iv: [u8; BLOCK_SIZE],
    current_iv: [u8; BLOCK_SIZE],
}

impl StreamingEncryptor {
    pub fn new(key: &[u8], initial_iv: &[u8]) -> Result<Self, EncryptionError> {
        check_key(key)?;
        check_iv(initial_iv)?;
        let mut key_arr = [0u8; KEY_SIZE];
        key_arr.copy_from_slice(key);
        let mut iv_arr = [0u8; BLOCK_SIZE];
        iv_arr.copy_from_slice(initial_iv);
        Ok(Self {
            key: key_arr,
            initial_iv: iv_arr,
            current_iv: iv_arr,
        })
    }

    /// Reconstructs an encryptor at an arbitrary part boundary: `current_iv`
    /// is the last ciphertext block of the last part already uploaded (the
    /// value a resumed upload reads back out of the resume journal).
    /// `initial_iv` is kept distinct from `current_iv` since callers still
    /// need it (e.g. to hand to `GetInitialIV()`/object metadata) even
    /// though it no longer drives the next `encrypt_part` call.
    pub fn resume_from(key: &[u8], initial_iv: &[u8], current_iv: &[u8]) -> Result<Self, EncryptionError> {
        check_key(key)?;
        check_iv(initial_iv)?;
        check_iv(current_iv)?;
        let mut key_arr = [0u8; KEY_SIZE];
        key_arr.copy_from_slice(key);
        let mut initial_arr = [0u8; BLOCK_SIZE];
        initial_arr.copy_from_slice(initial_iv);
        let mut current_arr = [0u8; BLOCK_SIZE];
        current_arr.copy_from_slice(current_iv);
        Ok(Self {
            key: key_arr,
            initial_iv: initial_arr,
            current_iv: current_arr,
        })
    }

    /// Generates a random key and initial IV, the way a fresh upload picks
    /// both once at `InitStreamingUpload` time.
    pub fn new_random() -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);
        Self {
            key,
            initial_iv: iv,
            current_iv: iv,
        }
    }

    pub fn get_key(&self) -> [u8; KEY_SIZE] {
        self.key
    }

    pub fn get_initial_iv(&self) -> [u8; BLOCK_SIZE] {
        self.initial_iv
    }

    pub fn get_current_iv(&self) -> [u8; BLOCK_SIZE] {
        self.current_iv
    }

    /// Encrypts one part. Non-final parts must be a whole-block multiple;
    /// the final part is PKCS#7-padded.
    pub fn encrypt_part(&mut self, plaintext: &[u8], is_final: bool) -> Result<Vec<u8>, EncryptionError> {
        if !is_final && plaintext.len() % BLOCK_SIZE != 0 {
            return Err(EncryptionError::InvariantError(plaintext.len()));
        }

        let cipher = Aes256CbcEnc::new(&self.key.into(), &self.current_iv.into());
        let ciphertext = if is_final {
            cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        } else {
            cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext)
        };

        if ciphertext.len() >= BLOCK_SIZE {
            self.current_iv
                .copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_SIZE..]);
        }
        Ok(ciphertext)
    }
}

/// Mirrors [`StreamingEncryptor`]: stateless between files, stateful across
/// the parts of one file. Parts must arrive in order; padding is stripped
/// only on the part marked `is_final`.
pub struct StreamingDecryptor {
    key: [u8; KEY_SIZE],
    current_iv: [u8; BLOCK_SIZE],
}

impl StreamingDecryptor {
    /// `current_iv` lets a resumed download reconstruct a decryptor at any
    /// part boundary by supplying the last ciphertext block already
    /// consumed (the initial IV for part 0).
    pub fn resume_from(key: &[u8], current_iv: &[u8]) -> Result<Self, EncryptionError> {
        check_key(key)?;
        check_iv(current_iv)?;
        let mut key_arr = [0u8; KEY_SIZE];
        key_arr.copy_from_slice(key);
        let mut iv_arr = [0u8; BLOCK_SIZE];
        iv_arr.copy_from_slice(current_iv);
        Ok(Self {
            key: key_arr,
            current_iv: iv_arr,
        })
    }

    pub fn new(key: &[u8], initial_iv: &[u8]) -> Result<Self, EncryptionError> {
        Self::resume_from(key, initial_iv)
    }

    pub fn get_current_iv(&self) -> [u8; BLOCK_SIZE] {
        self.current_iv
    }

    pub fn decrypt_part(&mut self, ciphertext: &[u8], is_final: bool) -> Result<Vec<u8>, EncryptionError> {
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(EncryptionError::InvariantError(ciphertext.len()));
        }

        let next_iv = if ciphertext.len() >= BLOCK_SIZE {
            let mut iv = [0u8; BLOCK_SIZE];
            iv.copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_SIZE..]);
            Some(iv)
        } else {
            None
        };

        let cipher = Aes256CbcDec::new(&self.key.into(), &self.current_iv.into());
        let mut buf = ciphertext.to_vec();
        let plaintext_len = if is_final {
            cipher
                .decrypt_padded_mut::<Pkcs7>(&mut buf)
                .map_err(|_| EncryptionError::Unpad)?
                .len()
        } else {
            cipher
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|_| EncryptionError::Unpad)?
                .len()
        };
        buf.truncate(plaintext_len);

        if let Some(iv) = next_iv {
            self.current_iv = iv;
        }
        Ok(buf)
    }
}

/// Pre-encrypt mode (`formatVersion = 0`): a single CBC pass over the whole
/// plaintext with a random IV, used for the legacy temp-file upload path.
pub fn encrypt_whole(key: &[u8], plaintext: &[u8]) -> Result<([u8; BLOCK_SIZE], Vec<u8>), EncryptionError> {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    let mut encryptor = StreamingEncryptor::new(key, &iv)?;
    let ciphertext = encryptor.encrypt_part(plaintext, true)?;
    Ok((iv, ciphertext))
}

pub fn decrypt_whole(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let mut decryptor = StreamingDecryptor::new(key, iv)?;
    decryptor.decrypt_part(ciphertext, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; KEY_SIZE] {
        [7u8; KEY_SIZE]
    }

    fn iv() -> [u8; BLOCK_SIZE] {
        [9u8; BLOCK_SIZE]
    }

    #[test]
    fn round_trips_single_final_part() {
        let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let plaintext = b"hello world, this is not block aligned";
        let ciphertext = enc.encrypt_part(plaintext, true).unwrap();

        let mut dec = StreamingDecryptor::new(&key(), &iv()).unwrap();
        let round_tripped = dec.decrypt_part(&ciphertext, true).unwrap();
        assert_eq!(round_tripped, plaintext);
    }

    #[test]
    fn round_trips_multiple_parts_with_chained_iv() {
        let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let part0 = vec![1u8; 32]; // whole blocks
        let part1 = vec![2u8; 16];
        let part2 = b"final part, any length".to_vec();

        let c0 = enc.encrypt_part(&part0, false).unwrap();
        let c1 = enc.encrypt_part(&part1, false).unwrap();
        let c2 = enc.encrypt_part(&part2, true).unwrap();

        let mut dec = StreamingDecryptor::new(&key(), &iv()).unwrap();
        assert_eq!(dec.decrypt_part(&c0, false).unwrap(), part0);
        assert_eq!(dec.decrypt_part(&c1, false).unwrap(), part1);
        assert_eq!(dec.decrypt_part(&c2, true).unwrap(), part2);
    }

    #[test]
    fn non_final_part_must_be_block_aligned() {
        let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let err = enc.encrypt_part(&[1u8; 17], false).unwrap_err();
        assert!(matches!(err, EncryptionError::InvariantError(17)));
    }

    #[test]
    fn resume_from_current_iv_reconstructs_decryptor_mid_stream() {
        let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let part0 = vec![1u8; 32];
        let part1 = b"final part after resume".to_vec();
        let c0 = enc.encrypt_part(&part0, false).unwrap();
        let current_iv_after_part0 = enc.get_current_iv();
        let c1 = enc.encrypt_part(&part1, true).unwrap();

        let mut dec = StreamingDecryptor::resume_from(&key(), &current_iv_after_part0).unwrap();
        let round_tripped = dec.decrypt_part(&c1, true).unwrap();
        assert_eq!(round_tripped, part1);
    }

    #[test]
    fn resume_from_reconstructs_encryptor_matching_live_chain() {
        let mut live = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let part0 = vec![3u8; 48];
        let c0 = live.encrypt_part(&part0, false).unwrap();
        let cursor = live.get_current_iv();

        let mut resumed = StreamingEncryptor::resume_from(&key(), &iv(), &cursor).unwrap();
        let part1 = b"tail after a process restart".to_vec();
        let resumed_c1 = resumed.encrypt_part(&part1, true).unwrap();
        let live_c1 = live.encrypt_part(&part1, true).unwrap();
        assert_eq!(resumed_c1, live_c1);
        let _ = c0;
    }

    #[test]
    fn encrypt_whole_round_trips() {
        let plaintext = b"a whole small file encrypted in one pre-encrypt pass";
        let (iv, ciphertext) = encrypt_whole(&key(), plaintext).unwrap();
        let decrypted = decrypt_whole(&key(), &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn different_keys_do_not_decrypt_to_same_plaintext() {
        let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let ciphertext = enc.encrypt_part(b"secret payload", true).unwrap();
        let mut dec = StreamingDecryptor::new(&[1u8; KEY_SIZE], &iv()).unwrap();
        assert!(dec.decrypt_part(&ciphertext, true).is_err());
    }

    /// Round-trip across the exact sizes called out for coverage: empty,
    /// one byte under/over a block boundary, exactly one and two blocks,
    /// and a size large enough to span many parts.
    #[test]
    fn round_trips_across_named_sizes() {
        for n in [0usize, 1, 15, 16, 17, 31, 32, 1024 * 1024] {
            let plaintext: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
            let ciphertext = enc.encrypt_part(&plaintext, true).unwrap();
            let mut dec = StreamingDecryptor::new(&key(), &iv()).unwrap();
            let round_tripped = dec.decrypt_part(&ciphertext, true).unwrap();
            assert_eq!(round_tripped, plaintext, "mismatch for n = {n}");
        }
    }

    /// CBC-chain equivalence (spec §8): for any partitioning of a
    /// plaintext into non-empty, block-aligned-except-last prefix parts,
    /// the concatenation of sequential `encrypt_part` calls equals a
    /// single-pass whole-file encryption with the same key and initial IV.
    #[test]
    fn streaming_parts_concatenate_to_whole_file_ciphertext() {
        let whole: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();

        let partitionings: [&[usize]; 4] = [
            &[5000],
            &[16, 4984],
            &[32, 32, 32, 4904],
            &[16, 16, 16, 16, 16, 4920],
        ];

        for boundaries in partitionings {
            let (_, whole_ciphertext) = {
                let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
                let c = enc.encrypt_part(&whole, true).unwrap();
                (enc.get_initial_iv(), c)
            };

            let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
            let mut streamed = Vec::new();
            let mut offset = 0usize;
            for (i, &len) in boundaries.iter().enumerate() {
                let is_final = i + 1 == boundaries.len();
                let part = &whole[offset..offset + len];
                streamed.extend(enc.encrypt_part(part, is_final).unwrap());
                offset += len;
            }
            assert_eq!(offset, whole.len());
            assert_eq!(streamed, whole_ciphertext, "partitioning {boundaries:?} diverged from whole-file ciphertext");
        }
    }

    #[test]
    fn empty_and_single_block_are_explicit_round_trip_cases() {
        let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let empty_ciphertext = enc.encrypt_part(&[], true).unwrap();
        let mut dec = StreamingDecryptor::new(&key(), &iv()).unwrap();
        assert_eq!(dec.decrypt_part(&empty_ciphertext, true).unwrap(), Vec::<u8>::new());

        let mut enc = StreamingEncryptor::new(&key(), &iv()).unwrap();
        let one_block = vec![42u8; BLOCK_SIZE];
        let ciphertext = enc.encrypt_part(&one_block, true).unwrap();
        let mut dec = StreamingDecryptor::new(&key(), &iv()).unwrap();
        assert_eq!(dec.decrypt_part(&ciphertext, true).unwrap(), one_block);
    }
}
