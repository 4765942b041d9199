//! Metadata collaborator: persistence of `FileRecord`s.
//!
//! Two backends are available:
//!   - **Memory**: a locked `BTreeMap`, lost on exit. Deletes are hard.
//!   - **JSON**: the same map mirrored to a JSON document, flushed atomically
//!     after every mutation. Deletes are soft (`deleted_at` is set and the
//!     record disappears from `get`/`list`).
//!
//! Both implement `MetadataStore`, so the engine can use either transparently.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use lockbox_core::types::unix_now;
use lockbox_core::{FileId, FileRecord, LockboxError, LockboxResult, OwnerId};
use lockbox_storage::{sweep_staging_in, AtomicWriter, DEFAULT_STAGING_MAX_AGE};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Record persistence shared by concurrent requests.
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. The store assigns the id; `record.id` is ignored.
    fn create(&self, record: FileRecord) -> LockboxResult<FileId>;
    /// Look up a live record.
    fn get(&self, id: FileId) -> LockboxResult<Option<FileRecord>>;
    /// Replace an existing live record (`NotFound` otherwise).
    fn save(&self, record: &FileRecord) -> LockboxResult<()>;
    /// Remove a live record (`NotFound` otherwise).
    fn delete(&self, id: FileId) -> LockboxResult<()>;
    /// Live records owned by `owner`, ordered by id.
    fn list(&self, owner: OwnerId) -> LockboxResult<Vec<FileRecord>>;
}

impl<T: MetadataStore + ?Sized> MetadataStore for std::sync::Arc<T> {
    fn create(&self, record: FileRecord) -> LockboxResult<FileId> {
        (**self).create(record)
    }
    fn get(&self, id: FileId) -> LockboxResult<Option<FileRecord>> {
        (**self).get(id)
    }
    fn save(&self, record: &FileRecord) -> LockboxResult<()> {
        (**self).save(record)
    }
    fn delete(&self, id: FileId) -> LockboxResult<()> {
        (**self).delete(id)
    }
    fn list(&self, owner: OwnerId) -> LockboxResult<Vec<FileRecord>> {
        (**self).list(owner)
    }
}

/// Records plus the id counter, as held in memory and on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Table {
    next_id: u64,
    records: BTreeMap<FileId, FileRecord>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            next_id: 1,
            records: BTreeMap::new(),
        }
    }
}

impl Table {
    fn live(&self, id: FileId) -> Option<&FileRecord> {
        self.records.get(&id).filter(|r| !r.is_deleted())
    }

    fn insert_new(&mut self, mut record: FileRecord) -> LockboxResult<FileId> {
        record.validate()?;
        let id = FileId(self.next_id);
        self.next_id += 1;
        record.id = id;
        record.deleted_at = None;
        self.records.insert(id, record);
        Ok(id)
    }

    fn list(&self, owner: OwnerId) -> Vec<FileRecord> {
        self.records
            .values()
            .filter(|r| !r.is_deleted() && r.is_owned_by(owner))
            .cloned()
            .collect()
    }
}

fn lock(table: &Mutex<Table>) -> LockboxResult<MutexGuard<'_, Table>> {
    table
        .lock()
        .map_err(|_| LockboxError::Metadata("metadata lock poisoned".into()))
}

// ── Memory backend ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    table: Mutex<Table>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn create(&self, record: FileRecord) -> LockboxResult<FileId> {
        lock(&self.table)?.insert_new(record)
    }

    fn get(&self, id: FileId) -> LockboxResult<Option<FileRecord>> {
        Ok(lock(&self.table)?.live(id).cloned())
    }

    fn save(&self, record: &FileRecord) -> LockboxResult<()> {
        record.validate()?;
        let mut table = lock(&self.table)?;
        match table.records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(LockboxError::NotFound(record.id)),
        }
    }

    fn delete(&self, id: FileId) -> LockboxResult<()> {
        lock(&self.table)?
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or(LockboxError::NotFound(id))
    }

    fn list(&self, owner: OwnerId) -> LockboxResult<Vec<FileRecord>> {
        Ok(lock(&self.table)?.list(owner))
    }
}

// ── JSON backend ─────────────────────────────────────────────────────────────

/// Metadata persisted to a single JSON document.
///
/// Every mutation is applied in memory, flushed with an atomic write, and
/// rolled back in memory if the flush fails, so the document and the mirror
/// never disagree.
#[derive(Debug)]
pub struct JsonMetadataStore {
    path: PathBuf,
    writer: AtomicWriter,
    table: Mutex<Table>,
}

impl JsonMetadataStore {
    /// Load or create a store at the given path.
    /// If the file doesn't exist, starts empty; it is written on first mutation.
    pub fn open(path: &Path) -> LockboxResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            sweep_staging_in(parent, DEFAULT_STAGING_MAX_AGE)?;
        }

        let table = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| LockboxError::io(format!("reading metadata {}", path.display()), e))?;
            serde_json::from_str(&content).map_err(|e| {
                LockboxError::Metadata(format!("parsing metadata {}: {e}", path.display()))
            })?
        } else {
            Table::default()
        };

        debug!(path = %path.display(), records = table.records.len(), "metadata loaded");
        Ok(Self {
            path: path.to_path_buf(),
            writer: AtomicWriter::default(),
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, table: &Table) -> LockboxResult<()> {
        let json = serde_json::to_vec_pretty(table)
            .map_err(|e| LockboxError::Metadata(format!("serializing metadata: {e}")))?;
        self.writer.write_bytes(&self.path, &json)?;
        Ok(())
    }
}

impl MetadataStore for JsonMetadataStore {
    fn create(&self, record: FileRecord) -> LockboxResult<FileId> {
        let mut table = lock(&self.table)?;
        let id = table.insert_new(record)?;
        if let Err(e) = self.flush(&table) {
            table.records.remove(&id);
            table.next_id -= 1;
            return Err(e);
        }
        Ok(id)
    }

    fn get(&self, id: FileId) -> LockboxResult<Option<FileRecord>> {
        Ok(lock(&self.table)?.live(id).cloned())
    }

    fn save(&self, record: &FileRecord) -> LockboxResult<()> {
        record.validate()?;
        let mut table = lock(&self.table)?;
        if table.live(record.id).is_none() {
            return Err(LockboxError::NotFound(record.id));
        }
        let previous = table.records.insert(record.id, record.clone());
        if let Err(e) = self.flush(&table) {
            if let Some(previous) = previous {
                table.records.insert(record.id, previous);
            }
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, id: FileId) -> LockboxResult<()> {
        let mut table = lock(&self.table)?;
        let record = table
            .records
            .get_mut(&id)
            .filter(|r| !r.is_deleted())
            .ok_or(LockboxError::NotFound(id))?;
        record.deleted_at = Some(unix_now());

        if let Err(e) = self.flush(&table) {
            if let Some(record) = table.records.get_mut(&id) {
                record.deleted_at = None;
            }
            return Err(e);
        }
        Ok(())
    }

    fn list(&self, owner: OwnerId) -> LockboxResult<Vec<FileRecord>> {
        Ok(lock(&self.table)?.list(owner))
    }
}
