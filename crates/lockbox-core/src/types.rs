use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{LockboxError, LockboxResult};

/// Opaque file identity assigned by the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller identity, as vouched for by the identity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl OwnerId {
    /// Directory name for this owner under the storage root
    pub fn dir_name(&self) -> String {
        format!("owner_{}", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata for one stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    /// Sanitized base name
    pub name: String,
    #[serde(default)]
    pub content_type: String,
    /// Location of the bytes, relative to the storage root (`owner_<id>/<name>`)
    pub storage_path: PathBuf,
    #[serde(default)]
    pub description: String,
    pub owner_id: OwnerId,
    /// Fixed at creation
    pub is_encrypted: bool,
    /// Plaintext length in bytes
    #[serde(default)]
    pub size: u64,
    pub created_at: u64,
    pub updated_at: u64,
    /// Soft-delete marker (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<u64>,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_owned_by(&self, requester: OwnerId) -> bool {
        self.owner_id == requester
    }

    /// Check the fields every persisted record must carry.
    pub fn validate(&self) -> LockboxResult<()> {
        if self.name.trim().is_empty() {
            return Err(LockboxError::InvalidName("name is required".into()));
        }
        if self.storage_path.as_os_str().is_empty() {
            return Err(LockboxError::Metadata(format!(
                "record {} has no storage path",
                self.id
            )));
        }
        Ok(())
    }
}

/// Owner-initiated metadata change. Absent or empty fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordPatch {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub description: Option<String>,
}

impl RecordPatch {
    pub fn name(&self) -> Option<&str> {
        non_empty(&self.name)
    }

    pub fn content_type(&self) -> Option<&str> {
        non_empty(&self.content_type)
    }

    pub fn description(&self) -> Option<&str> {
        non_empty(&self.description)
    }

    pub fn is_empty(&self) -> bool {
        self.name().is_none() && self.content_type().is_none() && self.description().is_none()
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Current time as Unix seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
