//! Post-download size verification (spec §4.7): a zero-byte file is always
//! an error, and the on-disk size must match the declared size.
use std::path::Path;

use crate::error::IntegrityError;

pub fn verify_download_size(path: &Path, expected: u64, actual: u64) -> Result<(), IntegrityError> {
    if actual == 0 {
        return Err(IntegrityError::ZeroByteFile(path.to_path_buf()));
    }
    if actual != expected {
        return Err(IntegrityError::SizeMismatch { expected, actual });
    }
    Ok(())
}
