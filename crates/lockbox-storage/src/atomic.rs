//! All-or-nothing file publication: stage beside the destination, fsync, rename.
//!
//! A reader of the final path sees either the previous content or the complete
//! new content, never a prefix. A crash mid-write leaves at most a
//! `.lockbox-staging-*` file, which [`sweep_staging`] removes once it is older
//! than the configured grace period.

use std::fs::{self, DirBuilder};
#[cfg(unix)]
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use lockbox_core::{LockboxError, LockboxResult};
use tempfile::TempPath;
use tracing::{debug, info, warn};

/// Name prefix of every in-flight staging file
pub const STAGING_PREFIX: &str = ".lockbox-staging-";

/// Staging files younger than this may belong to a write still in progress
pub const DEFAULT_STAGING_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// A file just made visible at its final path, not yet confirmed.
///
/// Whatever the path held before is kept as a hard-linked staging file until
/// [`commit`](Published::commit) drops it or [`rollback`](Published::rollback)
/// puts it back. Dropping a `Published` commits.
#[derive(Debug)]
pub struct Published {
    path: PathBuf,
    reported: u64,
    previous: Option<TempPath>,
}

impl Published {
    /// Byte count returned by the producer
    pub fn reported(&self) -> u64 {
        self.reported
    }

    /// Whether the publish displaced an existing file
    pub fn replaced(&self) -> bool {
        self.previous.is_some()
    }

    pub fn commit(self) -> u64 {
        self.reported
    }

    /// Undo the publish: restore the displaced file, or remove ours if the
    /// path was empty before.
    pub fn rollback(self) -> LockboxResult<()> {
        let dir = parent_dir(&self.path).to_path_buf();
        let result = match self.previous {
            Some(previous) => previous.persist(&self.path).map_err(|e| {
                LockboxError::io(format!("restoring {}", self.path.display()), e.error)
            }),
            None => fs::remove_file(&self.path)
                .map_err(|e| LockboxError::io(format!("removing {}", self.path.display()), e)),
        };
        sync_dir(&dir);
        result
    }
}

/// Publishes files atomically and creates the directories they live in.
#[derive(Debug, Clone, Copy)]
pub struct AtomicWriter {
    dir_mode: u32,
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self { dir_mode: 0o700 }
    }
}

impl AtomicWriter {
    pub fn new(dir_mode: u32) -> Self {
        Self { dir_mode }
    }

    pub fn dir_mode(&self) -> u32 {
        self.dir_mode
    }

    /// Create `dir` and any missing ancestors. Idempotent.
    pub fn ensure_dir(&self, dir: &Path) -> LockboxResult<()> {
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.dir_mode);
        }
        builder
            .create(dir)
            .map_err(|e| LockboxError::io(format!("creating directory {}", dir.display()), e))
    }

    /// Stage whatever `produce` writes, then publish it at `final_path`.
    ///
    /// `produce` returns the byte count reported back to the caller (for the
    /// encrypted path that is the plaintext length, not the bytes on disk).
    /// If it fails, the staging file is removed and `final_path` is untouched.
    pub fn write<F>(&self, final_path: &Path, produce: F) -> LockboxResult<u64>
    where
        F: FnOnce(&mut dyn Write) -> LockboxResult<u64>,
    {
        self.publish(final_path, produce).map(Published::commit)
    }

    /// Like [`write`](Self::write), but the caller decides afterwards whether
    /// the new content stays. See [`Published`].
    pub fn publish<F>(&self, final_path: &Path, produce: F) -> LockboxResult<Published>
    where
        F: FnOnce(&mut dyn Write) -> LockboxResult<u64>,
    {
        let dir = parent_dir(final_path);
        self.ensure_dir(dir)?;

        let mut staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| {
                LockboxError::io(format!("creating staging file in {}", dir.display()), e)
            })?;

        let reported = {
            let mut out = BufWriter::new(staging.as_file_mut());
            let reported = produce(&mut out)?;
            out.flush()
                .map_err(|e| LockboxError::from_io(e, "flushing staging file"))?;
            reported
        };

        staging
            .as_file()
            .sync_all()
            .map_err(|e| LockboxError::io("syncing staging file", e))?;

        let previous = keep_previous(final_path, dir)?;
        staging.persist(final_path).map_err(|e| {
            LockboxError::io(format!("publishing {}", final_path.display()), e.error)
        })?;
        sync_dir(dir);

        debug!(
            path = %final_path.display(),
            bytes = reported,
            replaced = previous.is_some(),
            "published"
        );
        Ok(Published {
            path: final_path.to_path_buf(),
            reported,
            previous,
        })
    }

    /// Publish an in-memory buffer.
    pub fn write_bytes(&self, final_path: &Path, bytes: &[u8]) -> LockboxResult<u64> {
        self.write(final_path, |out| {
            out.write_all(bytes)
                .map_err(|e| LockboxError::io("writing staging file", e))?;
            Ok(bytes.len() as u64)
        })
    }

    /// Move a published file. Fails with `AlreadyExists` rather than replace
    /// something already at `to`, including a file that appears concurrently.
    pub fn relocate(&self, from: &Path, to: &Path) -> LockboxResult<()> {
        let dir = parent_dir(to);
        self.ensure_dir(dir)?;
        fs::hard_link(from, to).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                LockboxError::AlreadyExists(to.display().to_string())
            }
            _ => LockboxError::io(
                format!("moving {} to {}", from.display(), to.display()),
                e,
            ),
        })?;
        if let Err(e) = fs::remove_file(from) {
            // Both names point at the same bytes; drop the new one again
            let _ = fs::remove_file(to);
            return Err(LockboxError::io(format!("removing {}", from.display()), e));
        }
        sync_dir(dir);
        if let Some(old_dir) = from.parent().filter(|p| *p != dir) {
            sync_dir(old_dir);
        }
        Ok(())
    }
}

/// Hard-link whatever sits at `final_path` to a fresh staging name, so a
/// rollback can put it back. `None` when the path is empty.
fn keep_previous(final_path: &Path, dir: &Path) -> LockboxResult<Option<TempPath>> {
    let kept = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .make_in(dir, |candidate| fs::hard_link(final_path, candidate));
    match kept {
        Ok(link) => Ok(Some(link.into_temp_path())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockboxError::io(
            format!("keeping previous {}", final_path.display()),
            e,
        )),
    }
}

/// Remove staging leftovers directly inside `dir` whose last modification is
/// at least `max_age` ago. Returns how many were removed.
///
/// Younger files are left alone: another process sharing the directory may
/// still be writing them.
pub fn sweep_staging_in(dir: &Path, max_age: Duration) -> LockboxResult<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(LockboxError::io(
                format!("listing {}", dir.display()),
                e,
            ))
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| LockboxError::io(format!("listing {}", dir.display()), e))?;
        let is_staging = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(STAGING_PREFIX));
        if !is_staging || !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= max_age);
        if !stale {
            debug!(path = %entry.path().display(), "staging file still fresh, keeping");
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), "could not remove staging file: {e}"),
        }
    }
    Ok(removed)
}

/// Remove stale staging leftovers in `root` and in every directory directly below it.
pub fn sweep_staging(root: &Path, max_age: Duration) -> LockboxResult<usize> {
    let mut removed = sweep_staging_in(root, max_age)?;

    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                removed += sweep_staging_in(&entry.path(), max_age)?;
            }
        }
    }

    if removed > 0 {
        info!(root = %root.display(), removed, "swept stale staging files");
    }
    Ok(removed)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Persist the rename itself. Best effort: not every platform can open a directory.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), "directory fsync failed: {e}");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn staging_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.starts_with(STAGING_PREFIX))
            .collect()
    }

    #[test]
    fn test_write_publishes_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("owner_1").join("report.txt");

        let n = AtomicWriter::default()
            .write_bytes(&target, b"hello world")
            .unwrap();

        assert_eq!(n, 11);
        assert_eq!(fs::read(&target).unwrap(), b"hello world");
        assert!(staging_files(target.parent().unwrap()).is_empty());
    }

    #[test]
    fn test_reported_count_comes_from_producer() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("blob");

        let n = AtomicWriter::default()
            .write(&target, |out| {
                out.write_all(b"0123456789").unwrap();
                Ok(4)
            })
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(fs::read(&target).unwrap().len(), 10);
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("partial.bin");

        let result = AtomicWriter::default().write(&target, |out| {
            out.write_all(&[7u8; 4096]).unwrap();
            Err(LockboxError::io(
                "reading plaintext",
                io::Error::new(io::ErrorKind::ConnectionReset, "gone"),
            ))
        });

        assert!(matches!(result, Err(LockboxError::StorageIo { .. })));
        assert!(!target.exists());
        assert!(staging_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_failed_write_keeps_previous_content() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("doc.txt");
        let writer = AtomicWriter::default();
        writer.write_bytes(&target, b"version one").unwrap();

        let result = writer.write(&target, |out| {
            out.write_all(b"version tw").unwrap();
            Err(LockboxError::Authentication)
        });

        assert!(result.is_err());
        assert_eq!(fs::read(&target).unwrap(), b"version one");
    }

    #[test]
    fn test_overwrite_replaces_whole_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("doc.txt");
        let writer = AtomicWriter::default();

        writer.write_bytes(&target, b"a much longer first version").unwrap();
        writer.write_bytes(&target, b"short").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"short");
    }

    #[cfg(unix)]
    #[test]
    fn test_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("a").join("b");
        let target = dir.join("secret.bin");
        AtomicWriter::new(0o700).write_bytes(&target, b"x").unwrap();

        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode & 0o077, 0, "directory mode {dir_mode:o}");
        let file_mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn test_ensure_dir_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("x").join("y");
        let writer = AtomicWriter::default();
        writer.ensure_dir(&dir).unwrap();
        writer.ensure_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_relocate() {
        let tmp = tempfile::TempDir::new().unwrap();
        let writer = AtomicWriter::default();
        let from = tmp.path().join("old.txt");
        let to = tmp.path().join("new.txt");
        writer.write_bytes(&from, b"payload").unwrap();

        writer.relocate(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn test_relocate_refuses_to_overwrite() {
        let tmp = tempfile::TempDir::new().unwrap();
        let writer = AtomicWriter::default();
        let from = tmp.path().join("a.txt");
        let to = tmp.path().join("b.txt");
        writer.write_bytes(&from, b"a").unwrap();
        writer.write_bytes(&to, b"b").unwrap();

        assert!(matches!(
            writer.relocate(&from, &to),
            Err(LockboxError::AlreadyExists(_))
        ));
        assert_eq!(fs::read(&from).unwrap(), b"a");
        assert_eq!(fs::read(&to).unwrap(), b"b");
    }

    /// Backdate a file's mtime by `by`
    fn age(path: &Path, by: Duration) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[test]
    fn test_sweep_staging() {
        let tmp = tempfile::TempDir::new().unwrap();
        let owner = tmp.path().join("owner_9");
        fs::create_dir_all(&owner).unwrap();

        let stale_root = tmp.path().join(".lockbox-staging-abc");
        let stale_owner = owner.join(".lockbox-staging-def");
        fs::write(&stale_root, b"stale").unwrap();
        fs::write(&stale_owner, b"stale").unwrap();
        fs::write(owner.join("keep.txt"), b"live").unwrap();
        age(&stale_root, 2 * HOUR);
        age(&stale_owner, 2 * HOUR);
        age(&owner.join("keep.txt"), 2 * HOUR);

        assert_eq!(sweep_staging(tmp.path(), HOUR).unwrap(), 2);
        assert!(owner.join("keep.txt").exists());
        assert!(staging_files(&owner).is_empty());
        assert!(staging_files(tmp.path()).is_empty());

        // Nothing left the second time
        assert_eq!(sweep_staging(tmp.path(), HOUR).unwrap(), 0);
    }

    #[test]
    fn test_sweep_keeps_fresh_staging() {
        let tmp = tempfile::TempDir::new().unwrap();
        let owner = tmp.path().join("owner_3");
        fs::create_dir_all(&owner).unwrap();

        let in_flight = owner.join(".lockbox-staging-inflight");
        let abandoned = owner.join(".lockbox-staging-abandoned");
        fs::write(&in_flight, b"half").unwrap();
        fs::write(&abandoned, b"old").unwrap();
        age(&abandoned, 2 * HOUR);

        assert_eq!(sweep_staging(tmp.path(), HOUR).unwrap(), 1);
        assert!(in_flight.exists());
        assert!(!abandoned.exists());
    }

    #[test]
    fn test_sweep_does_not_break_open_write() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("owner_1").join("f");
        let writer = AtomicWriter::default();

        writer
            .write(&target, |out| {
                out.write_all(b"first half ").unwrap();
                // Another instance opening the same root mid-write
                sweep_staging(tmp.path(), DEFAULT_STAGING_MAX_AGE).unwrap();
                out.write_all(b"second half").unwrap();
                Ok(22)
            })
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"first half second half");
    }

    #[test]
    fn test_sweep_missing_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(sweep_staging(&tmp.path().join("absent"), HOUR).unwrap(), 0);
    }

    #[test]
    fn test_publish_rollback_restores_previous() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("doc.txt");
        let writer = AtomicWriter::default();
        writer.write_bytes(&target, b"version one").unwrap();

        let published = writer
            .publish(&target, |out| {
                out.write_all(b"version two").unwrap();
                Ok(11)
            })
            .unwrap();
        assert!(published.replaced());
        assert_eq!(fs::read(&target).unwrap(), b"version two");

        published.rollback().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"version one");
        assert!(staging_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_publish_rollback_removes_new_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("fresh.bin");

        let published = AtomicWriter::default()
            .publish(&target, |out| {
                out.write_all(b"x").unwrap();
                Ok(1)
            })
            .unwrap();
        assert!(!published.replaced());

        published.rollback().unwrap();
        assert!(!target.exists());
        assert!(staging_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_publish_commit_drops_previous() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("doc.txt");
        let writer = AtomicWriter::default();
        writer.write_bytes(&target, b"old").unwrap();

        let published = writer
            .publish(&target, |out| {
                out.write_all(b"new").unwrap();
                Ok(3)
            })
            .unwrap();
        assert_eq!(published.commit(), 3);
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(staging_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_relocate_into_new_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let writer = AtomicWriter::default();
        let from = tmp.path().join("owner_1").join("a.txt");
        let to = tmp.path().join("owner_2").join("a.txt");
        writer.write_bytes(&from, b"payload").unwrap();

        writer.relocate(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn test_relocate_missing_source() {
        let tmp = tempfile::TempDir::new().unwrap();
        let to = tmp.path().join("b.txt");

        let result = AtomicWriter::default().relocate(&tmp.path().join("absent"), &to);
        assert!(matches!(result, Err(LockboxError::StorageIo { .. })));
        assert!(!to.exists());
    }
}
