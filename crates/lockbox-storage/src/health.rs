//! Storage root health check

use std::io::Write;
use std::path::Path;

use lockbox_core::{LockboxError, LockboxResult};

use crate::atomic::STAGING_PREFIX;

/// Verify the root exists, is a directory, and accepts a write
pub fn check_root(root: &Path) -> LockboxResult<()> {
    let meta = std::fs::metadata(root)
        .map_err(|e| LockboxError::io(format!("storage root {}", root.display()), e))?;
    if !meta.is_dir() {
        return Err(LockboxError::io(
            format!("storage root {}", root.display()),
            std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
        ));
    }

    // Probe with a staging-named file so a crash here is swept like any other
    let mut probe = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".probe")
        .tempfile_in(root)
        .map_err(|e| LockboxError::io(format!("writing probe in {}", root.display()), e))?;
    probe
        .write_all(b"ok")
        .and_then(|()| probe.as_file().sync_all())
        .map_err(|e| LockboxError::io(format!("writing probe in {}", root.display()), e))?;
    probe
        .close()
        .map_err(|e| LockboxError::io(format!("removing probe in {}", root.display()), e))
}

/// Returns true if the root is usable, false otherwise (non-panicking)
pub fn is_healthy(root: &Path) -> bool {
    check_root(root).is_ok()
}
