//! Integrity & verification (C7): pre-upload disk-space checks, post-download
//! size/checksum verification with a computed-hash short-circuit, and a
//! case-insensitive hex comparison that rejects any declared algorithm
//! other than SHA-512.
#![deny(unsafe_code)]

mod checksum;
mod disk;
mod error;
mod size;
mod verify;

pub use checksum::verify_checksums;
pub use disk::{check_available_space, DOWNLOAD_SAFETY_MARGIN, UPLOAD_TEMP_SAFETY_MARGIN};
pub use error::IntegrityError;
pub use size::verify_download_size;
pub use verify::verify_download;
