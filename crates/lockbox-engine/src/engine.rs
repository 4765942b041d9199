//! File engine: store, retrieve and manage owner-scoped files.
//!
//! Store pipeline:
//!   validate key → sanitize name → stage (+ encrypt) → rename → create record
//!
//! Retrieve pipeline:
//!   record → owner check → key check → open → (verify first chunk) → stream
//!
//! The key is never stored: an encrypted file can only be read back by a
//! caller presenting the same key. An empty key counts as no key. Bytes are
//! published before the record is created, so a record never points at a
//! half-written file; if the record cannot be created the publish is undone.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::time::Duration;

use lockbox_core::config::StorageConfig;
use lockbox_core::types::unix_now;
use lockbox_core::{FileId, FileRecord, LockboxError, LockboxResult, OwnerId, RecordPatch};
use lockbox_crypto::{validate_chunk_size, ChunkDecryptor, ChunkEncryptor, DecryptReader, EncryptionKey};
use lockbox_storage::StorageLayout;
use tracing::{debug, info, warn};

use crate::metadata::MetadataStore;

/// What the caller wants stored, minus the content itself
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub owner: OwnerId,
    /// Raw, unsanitized name
    pub name: String,
    pub content_type: String,
    pub description: String,
}

impl StoreRequest {
    pub fn new(owner: OwnerId, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
            content_type: String::new(),
            description: String::new(),
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Plaintext of a retrieved file, read lazily from disk.
pub enum PlaintextStream {
    Raw(File),
    Decrypted(DecryptReader<BufReader<File>>),
}

impl Read for PlaintextStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Raw(file) => file.read(buf),
            Self::Decrypted(reader) => reader.read(buf),
        }
    }
}

impl std::fmt::Debug for PlaintextStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(_) => f.write_str("PlaintextStream::Raw"),
            Self::Decrypted(_) => f.write_str("PlaintextStream::Decrypted"),
        }
    }
}

#[derive(Debug)]
pub struct Retrieved {
    pub record: FileRecord,
    pub content: PlaintextStream,
}

pub struct FileEngine<M> {
    layout: StorageLayout,
    chunk_size: usize,
    metadata: M,
}

impl<M: MetadataStore> FileEngine<M> {
    /// Prepare the storage root and return a ready engine.
    ///
    /// Creates the root if needed and, when configured, removes staging files a
    /// previous process left behind.
    pub fn open(config: &StorageConfig, metadata: M) -> LockboxResult<Self> {
        validate_chunk_size(config.chunk_size)?;

        let layout = StorageLayout::new(&config.root, config.dir_mode);
        layout.init()?;
        if config.sweep_staging_on_start {
            layout.sweep_staging(Duration::from_secs(config.staging_max_age_secs))?;
        }

        info!(
            root = %config.root.display(),
            chunk_size = config.chunk_size,
            "file engine ready"
        );
        Ok(Self {
            layout,
            chunk_size: config.chunk_size,
            metadata,
        })
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    /// Persist `content` under `request.owner` and record it.
    ///
    /// With a key the bytes on disk are the chunked AES-GCM encoding and the
    /// record is marked encrypted; without one they are the plaintext.
    /// `size` in the returned record is always the plaintext length.
    ///
    /// Fails with `AlreadyExists` when a live record of the owner already
    /// uses the name; delete or rename it first.
    pub fn store<R: Read>(
        &self,
        request: StoreRequest,
        mut content: R,
        key: Option<&[u8]>,
    ) -> LockboxResult<FileRecord> {
        let key = parse_key(key)?;
        let resolved = self.layout.resolve(request.owner, &request.name)?;
        let taken = self
            .metadata
            .list(request.owner)?
            .iter()
            .any(|r| r.storage_path == resolved.relative);
        if taken {
            return Err(LockboxError::AlreadyExists(resolved.name));
        }
        debug!(
            owner = %request.owner,
            path = %resolved.relative.display(),
            encrypted = key.is_some(),
            "storing"
        );

        let chunk_size = self.chunk_size;
        let published = self.layout.writer().publish(&resolved.absolute, |out| match &key {
            Some(key) => ChunkEncryptor::new(key, content, chunk_size)?.encrypt_to(out),
            None => io::copy(&mut content, out)
                .map_err(|e| LockboxError::from_io(e, "copying plaintext")),
        })?;

        let now = unix_now();
        let mut record = FileRecord {
            id: FileId(0),
            name: resolved.name,
            content_type: request.content_type,
            storage_path: resolved.relative,
            description: request.description,
            owner_id: request.owner,
            is_encrypted: key.is_some(),
            size: published.reported(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        match self.metadata.create(record.clone()) {
            Ok(id) => {
                record.id = id;
                published.commit();
            }
            Err(e) => {
                if let Err(cleanup) = published.rollback() {
                    warn!(
                        path = %resolved.absolute.display(),
                        "could not undo publish after metadata failure: {cleanup}"
                    );
                }
                return Err(e);
            }
        }

        info!(
            id = %record.id,
            owner = %record.owner_id,
            encrypted = record.is_encrypted,
            size = record.size,
            "stored file"
        );
        Ok(record)
    }

    /// Open a file's plaintext for its owner.
    ///
    /// For an encrypted file the first chunk is verified before this returns,
    /// so a wrong key fails here with `Authentication`. Damage further in
    /// surfaces from `read` (see `LockboxError::from_io`).
    pub fn retrieve(
        &self,
        id: FileId,
        requester: OwnerId,
        key: Option<&[u8]>,
    ) -> LockboxResult<Retrieved> {
        let record = self.owned(id, requester)?;

        // A bad key is rejected even when the file does not need one
        let key = parse_key(key)?;
        if record.is_encrypted && key.is_none() {
            return Err(LockboxError::KeyRequired);
        }

        let path = self.layout.absolute(&record.storage_path)?;
        let file = File::open(&path)
            .map_err(|e| LockboxError::io(format!("opening {}", record.storage_path.display()), e))?;

        let content = match (&key, record.is_encrypted) {
            (Some(key), true) => {
                let chunks = ChunkDecryptor::new(key, BufReader::new(file))?;
                PlaintextStream::Decrypted(DecryptReader::new(chunks)?)
            }
            (None, true) => return Err(LockboxError::KeyRequired),
            (_, false) => PlaintextStream::Raw(file),
        };

        info!(id = %id, owner = %requester, encrypted = record.is_encrypted, "retrieved file");
        Ok(Retrieved { record, content })
    }

    /// Metadata-only read
    pub fn stat(&self, id: FileId, requester: OwnerId) -> LockboxResult<FileRecord> {
        self.owned(id, requester)
    }

    /// The requester's live files, ordered by id
    pub fn list(&self, requester: OwnerId) -> LockboxResult<Vec<FileRecord>> {
        let mut records = self.metadata.list(requester)?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Apply the non-empty fields of `patch`.
    ///
    /// A new name is sanitized like a stored one and the bytes move with it,
    /// so `storage_path` keeps matching `owner_<id>/<name>`.
    pub fn update(
        &self,
        id: FileId,
        requester: OwnerId,
        patch: &RecordPatch,
    ) -> LockboxResult<FileRecord> {
        let mut record = self.owned(id, requester)?;
        if patch.is_empty() {
            return Ok(record);
        }

        let mut moved = None;
        if let Some(raw) = patch.name() {
            let resolved = self.layout.resolve(record.owner_id, raw)?;
            if resolved.relative != record.storage_path {
                let from = self.layout.absolute(&record.storage_path)?;
                self.layout
                    .writer()
                    .relocate(&from, &resolved.absolute)
                    .map_err(|e| match e {
                        LockboxError::AlreadyExists(_) => {
                            LockboxError::AlreadyExists(resolved.name.clone())
                        }
                        other => other,
                    })?;
                moved = Some((from, resolved.absolute));
                record.storage_path = resolved.relative;
            }
            record.name = resolved.name;
        }
        if let Some(content_type) = patch.content_type() {
            record.content_type = content_type.to_string();
        }
        if let Some(description) = patch.description() {
            record.description = description.to_string();
        }
        record.updated_at = unix_now();

        if let Err(e) = self.metadata.save(&record) {
            if let Some((from, to)) = moved {
                if let Err(undo) = self.layout.writer().relocate(&to, &from) {
                    warn!(
                        from = %to.display(),
                        to = %from.display(),
                        "could not revert rename after metadata failure: {undo}"
                    );
                }
            }
            return Err(e);
        }

        info!(id = %id, owner = %requester, "updated file");
        Ok(record)
    }

    /// Remove the record, then the bytes.
    ///
    /// Byte removal is best effort: a failure is logged and the delete still
    /// succeeds. Bytes still referenced by another live record are kept.
    pub fn delete(&self, id: FileId, requester: OwnerId) -> LockboxResult<()> {
        let record = self.owned(id, requester)?;
        self.metadata.delete(id)?;
        info!(id = %id, owner = %requester, "deleted file");

        let shared = match self.metadata.list(record.owner_id) {
            Ok(others) => others
                .iter()
                .any(|r| r.storage_path == record.storage_path),
            Err(e) => {
                warn!(id = %id, "could not check for shared bytes, keeping them: {e}");
                return Ok(());
            }
        };
        if shared {
            debug!(path = %record.storage_path.display(), "bytes still referenced, keeping");
            return Ok(());
        }

        let removal = self
            .layout
            .absolute(&record.storage_path)
            .and_then(|path| {
                std::fs::remove_file(&path)
                    .map_err(|e| LockboxError::io(format!("removing {}", path.display()), e))
            });
        if let Err(e) = removal {
            warn!(id = %id, "file record deleted but bytes remain: {e}");
        }
        Ok(())
    }

    /// Fetch a live record and check ownership.
    fn owned(&self, id: FileId, requester: OwnerId) -> LockboxResult<FileRecord> {
        let record = self
            .metadata
            .get(id)?
            .ok_or(LockboxError::NotFound(id))?;
        if !record.is_owned_by(requester) {
            debug!(id = %id, owner = %record.owner_id, requester = %requester, "ownership check failed");
            return Err(LockboxError::Unauthorized);
        }
        Ok(record)
    }
}

/// An empty key means "no key"; anything else must be a valid AES key.
fn parse_key(key: Option<&[u8]>) -> LockboxResult<Option<EncryptionKey>> {
    key.filter(|k| !k.is_empty())
        .map(EncryptionKey::from_slice)
        .transpose()
}
