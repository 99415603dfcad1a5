//! Pre-flight disk-space checks (spec §4.7): `required_bytes * safety_margin`
//! versus the filesystem's reported available bytes for a path's parent
//! directory. Grounded on the teacher's `sysinfo` workspace dependency
//! (`pageserver`'s disk-usage-based eviction already needs host free-space
//! numbers); `sysinfo::Disks` abstracts the Windows-vs-statfs split the spec
//! calls out, so there is no platform-specific branch here.
use std::path::Path;

use sysinfo::{DiskExt, System, SystemExt};
use tracing::debug;

use crate::error::IntegrityError;

/// Default safety margin applied to downloads: require 15% headroom beyond
/// the declared size.
pub const DOWNLOAD_SAFETY_MARGIN: f64 = 1.15;
/// Default safety margin applied to an upload's encrypted-temp file
/// (pre-encrypt mode only): ciphertext is only marginally larger than
/// plaintext (one block of PKCS#7 padding), so 5% headroom suffices.
pub const UPLOAD_TEMP_SAFETY_MARGIN: f64 = 1.05;

/// Finds the mounted filesystem with the longest matching mount point for
/// `path`, the same "longest prefix wins" resolution `df`/`statfs` callers
/// use to pick the right filesystem for a nested path.
fn available_bytes_for(path: &Path) -> Option<u64> {
    let mut system = System::new();
    system.refresh_disks_list();
    system
        .disks()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Checks that the parent directory of `path` has at least
/// `required_bytes * safety_margin` bytes free. A filesystem that can't be
/// resolved (e.g. an unusual mount setup in a test sandbox) is treated as
/// having unlimited space rather than failing a check we can't evaluate.
pub fn check_available_space(path: &Path, required_bytes: u64, safety_margin: f64) -> Result<(), IntegrityError> {
    let probe_dir = path.parent().unwrap_or(path);
    let Some(available) = available_bytes_for(probe_dir) else {
        debug!(path = %probe_dir.display(), "could not resolve filesystem for disk-space check, skipping");
        return Ok(());
    };

    let required = (required_bytes as f64 * safety_margin).ceil() as u64;
    if available < required {
        return Err(IntegrityError::InsufficientSpace {
            path: path.to_path_buf(),
            required_bytes: required,
            available_bytes: available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_filesystem_does_not_fail_the_check() {
        // A path that can't resolve to any real mount still passes: the
        // check degrades to a no-op rather than a false failure.
        let result = check_available_space(Path::new("/definitely/not/a/real/mount/x"), 1, 1.0);
        assert!(result.is_ok());
    }
}
