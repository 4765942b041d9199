//! Owner-scoped on-disk layout: `<root>/owner_<id>/<name>`
//!
//! Records store the path relative to the root (`owner_<id>/<name>`) so the
//! root can move; [`StorageLayout::absolute`] re-checks a recorded path before
//! it is ever joined onto the root.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use lockbox_core::{LockboxError, LockboxResult, OwnerId};

use crate::atomic::{sweep_staging, AtomicWriter, STAGING_PREFIX};

/// Reduce a caller-supplied name to a safe base name.
///
/// Trailing separators are dropped and only the last path segment is kept, so
/// `"../../secret"` becomes `"secret"` and `"a/b/"` becomes `"b"`. Both `/` and
/// `\` count as separators.
pub fn sanitize_name(raw: &str) -> LockboxResult<String> {
    let trimmed = raw.trim_end_matches(['/', '\\']);
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or_default();

    if base.is_empty() {
        return Err(LockboxError::InvalidName(format!(
            "{raw:?} has no usable file name"
        )));
    }
    if base == "." || base == ".." {
        return Err(LockboxError::InvalidName(format!("{raw:?} is not a file name")));
    }
    if base.contains('\0') {
        return Err(LockboxError::InvalidName("name contains a NUL byte".into()));
    }
    if base.starts_with(STAGING_PREFIX) {
        return Err(LockboxError::InvalidName(format!(
            "names starting with {STAGING_PREFIX} are reserved"
        )));
    }
    Ok(base.to_string())
}

/// A sanitized name and both forms of its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub name: String,
    /// `owner_<id>/<name>`, as recorded in metadata
    pub relative: PathBuf,
    pub absolute: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    writer: AtomicWriter,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, dir_mode: u32) -> Self {
        Self {
            root: root.into(),
            writer: AtomicWriter::new(dir_mode),
        }
    }

    /// Create the root directory. Safe to call on every startup.
    pub fn init(&self) -> LockboxResult<()> {
        self.writer.ensure_dir(&self.root)?;
        tracing::debug!(root = %self.root.display(), "storage root ready");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn writer(&self) -> &AtomicWriter {
        &self.writer
    }

    /// Absolute directory holding `owner`'s files
    pub fn owner_dir(&self, owner: OwnerId) -> PathBuf {
        self.root.join(owner.dir_name())
    }

    /// Relative storage path for an already-sanitized name
    pub fn relative(&self, owner: OwnerId, name: &str) -> PathBuf {
        PathBuf::from(owner.dir_name()).join(name)
    }

    /// Sanitize `raw_name` and place it in `owner`'s directory.
    pub fn resolve(&self, owner: OwnerId, raw_name: &str) -> LockboxResult<ResolvedPath> {
        let name = sanitize_name(raw_name)?;
        let relative = self.relative(owner, &name);
        let absolute = self.root.join(&relative);
        Ok(ResolvedPath {
            name,
            relative,
            absolute,
        })
    }

    /// Turn a recorded storage path back into an absolute one, refusing
    /// anything that would escape the root.
    pub fn absolute(&self, storage_path: &Path) -> LockboxResult<PathBuf> {
        if storage_path.as_os_str().is_empty() {
            return Err(LockboxError::Metadata("empty storage path".into()));
        }
        let escapes = storage_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(LockboxError::Metadata(format!(
                "storage path {} leaves the storage root",
                storage_path.display()
            )));
        }
        Ok(self.root.join(storage_path))
    }

    /// Remove staging files a crashed process left behind, sparing any
    /// younger than `max_age`.
    pub fn sweep_staging(&self, max_age: Duration) -> LockboxResult<usize> {
        sweep_staging(&self.root, max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_last_segment() {
        assert_eq!(sanitize_name("report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_name("../../secret").unwrap(), "secret");
        assert_eq!(sanitize_name("/etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_name("dir/sub/").unwrap(), "sub");
        assert_eq!(sanitize_name("C:\\Users\\me\\notes.txt").unwrap(), "notes.txt");
        assert_eq!(sanitize_name("..\\..\\boot.ini").unwrap(), "boot.ini");
        assert_eq!(sanitize_name(".hidden").unwrap(), ".hidden");
    }

    #[test]
    fn test_sanitize_rejects_unusable_names() {
        for raw in ["", "/", "///", "\\", ".", "..", "a/..", "x/.", "bad\0name"] {
            assert!(
                matches!(sanitize_name(raw), Err(LockboxError::InvalidName(_))),
                "{raw:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_sanitize_rejects_staging_prefix() {
        let raw = format!("{STAGING_PREFIX}x1y2");
        assert!(matches!(
            sanitize_name(&raw),
            Err(LockboxError::InvalidName(_))
        ));
    }

    #[test]
    fn test_resolve_stays_in_owner_dir() {
        let layout = StorageLayout::new("/srv/lockbox", 0o700);
        let resolved = layout.resolve(OwnerId(42), "../../secret").unwrap();

        assert_eq!(resolved.name, "secret");
        assert_eq!(resolved.relative, PathBuf::from("owner_42/secret"));
        assert_eq!(
            resolved.absolute,
            PathBuf::from("/srv/lockbox/owner_42/secret")
        );
        assert!(resolved.absolute.starts_with(layout.owner_dir(OwnerId(42))));
    }

    #[test]
    fn test_absolute_rejects_escapes() {
        let layout = StorageLayout::new("/srv/lockbox", 0o700);

        assert_eq!(
            layout.absolute(Path::new("owner_1/a.txt")).unwrap(),
            PathBuf::from("/srv/lockbox/owner_1/a.txt")
        );
        for bad in ["", "../outside", "owner_1/../../x", "/etc/passwd", "./owner_1/a"] {
            assert!(
                matches!(
                    layout.absolute(Path::new(bad)),
                    Err(LockboxError::Metadata(_))
                ),
                "{bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_init_creates_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("uploads"), 0o700);

        layout.init().unwrap();
        layout.init().unwrap();
        assert!(layout.root().is_dir());
    }

    #[test]
    fn test_init_fails_under_a_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let layout = StorageLayout::new(blocker.join("uploads"), 0o700);
        assert!(matches!(
            layout.init(),
            Err(LockboxError::StorageIo { .. })
        ));
    }
}
