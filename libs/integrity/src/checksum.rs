//! Checksum comparison (spec §4.7, §8 progress/integrity properties):
//! SHA-512 is the only mandatory algorithm; any other declared algorithm
//! surfaces `UnimplementedAlgorithm` rather than silently passing.
use cloud_model::HashFunction;
use tracing::warn;

use crate::error::IntegrityError;

/// Verifies `computed_sha512_hex` against whichever declared checksums are
/// present. `skip_checksum` demotes a mismatch (or an unimplemented
/// algorithm) to a logged warning instead of a hard failure, per the
/// caller-settable download policy flag in spec §4.6.2 step 4.
pub fn verify_checksums(
    declared: &[HashFunction],
    computed_sha512_hex: &str,
    skip_checksum: bool,
) -> Result<(), IntegrityError> {
    if declared.is_empty() {
        return Ok(());
    }

    for entry in declared {
        let result = match entry {
            HashFunction::Sha512(expected) => {
                if encryption_core::hashes_match(expected, computed_sha512_hex) {
                    Ok(())
                } else {
                    Err(IntegrityError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual: computed_sha512_hex.to_string(),
                    })
                }
            }
            HashFunction::Other { name, .. } => Err(IntegrityError::UnimplementedAlgorithm(name.clone())),
        };

        if let Err(err) = result {
            if skip_checksum {
                warn!(%err, "checksum verification failed but SkipChecksum is set, continuing");
                continue;
            }
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_sha512_passes() {
        let hash = encryption_core::sha512_hex(b"payload");
        let declared = vec![HashFunction::Sha512(hash.clone())];
        assert!(verify_checksums(&declared, &hash, false).is_ok());
    }

    #[test]
    fn mismatched_sha512_fails_without_skip() {
        let declared = vec![HashFunction::Sha512("deadbeef".into())];
        let err = verify_checksums(&declared, &encryption_core::sha512_hex(b"x"), false).unwrap_err();
        assert!(matches!(err, IntegrityError::ChecksumMismatch { .. }));
    }

    #[test]
    fn mismatched_sha512_is_a_warning_with_skip() {
        let declared = vec![HashFunction::Sha512("deadbeef".into())];
        assert!(verify_checksums(&declared, &encryption_core::sha512_hex(b"x"), true).is_ok());
    }

    #[test]
    fn unimplemented_algorithm_fails_without_skip() {
        let declared = vec![HashFunction::Other {
            name: "crc32".into(),
            value: "abc".into(),
        }];
        let err = verify_checksums(&declared, "whatever", false).unwrap_err();
        assert!(matches!(err, IntegrityError::UnimplementedAlgorithm(name) if name == "crc32"));
    }

    #[test]
    fn case_insensitive_match() {
        let hash = encryption_core::sha512_hex(b"payload");
        let declared = vec![HashFunction::Sha512(hash.to_uppercase())];
        assert!(verify_checksums(&declared, &hash, false).is_ok());
    }
}
