use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LockboxError, LockboxResult};

/// Default plaintext chunk size for encrypted files (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockboxConfig {
    pub storage: StorageConfig,
    pub metadata: MetadataConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding every owner's files (default: ./uploads)
    pub root: PathBuf,
    /// Plaintext bytes per encrypted chunk (default: 65536)
    pub chunk_size: usize,
    /// Mode for newly created owner directories (default: 0o700)
    pub dir_mode: u32,
    /// Remove leftover staging files when the engine opens (default: true)
    pub sweep_staging_on_start: bool,
    /// Staging files younger than this many seconds are assumed to belong to
    /// a write in progress and survive the sweep (default: 3600)
    pub staging_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// JSON metadata document (default: ./lockbox-metadata.json)
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./uploads"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            dir_mode: 0o700,
            sweep_staging_on_start: true,
            staging_max_age_secs: 60 * 60,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./lockbox-metadata.json"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl LockboxConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> LockboxResult<Self> {
        Ok(Self::load_optional(path)?.unwrap_or_default())
    }

    /// Like [`load`](Self::load), but `None` when the file does not exist so
    /// the caller can report it once logging is up.
    pub fn load_optional(path: &Path) -> LockboxResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| LockboxError::io(format!("reading config {}", path.display()), e))?;
        toml::from_str(&content)
            .map(Some)
            .map_err(|e| LockboxError::Config(format!("parsing config {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
root = "/srv/lockbox"
chunk_size = 1048576
dir_mode = 488
sweep_staging_on_start = false
staging_max_age_secs = 600

[metadata]
path = "/var/lib/lockbox/metadata.json"

[log]
level = "debug"
format = "json"
"#;
        let config: LockboxConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.storage.root, PathBuf::from("/srv/lockbox"));
        assert_eq!(config.storage.chunk_size, 1_048_576);
        assert_eq!(config.storage.dir_mode, 0o750);
        assert!(!config.storage.sweep_staging_on_start);
        assert_eq!(config.storage.staging_max_age_secs, 600);
        assert_eq!(
            config.metadata.path,
            PathBuf::from("/var/lib/lockbox/metadata.json")
        );
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: LockboxConfig = toml::from_str("").unwrap();

        assert_eq!(config.storage.root, PathBuf::from("./uploads"));
        assert_eq!(config.storage.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.storage.dir_mode, 0o700);
        assert!(config.storage.sweep_staging_on_start);
        assert_eq!(config.storage.staging_max_age_secs, 3600);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[storage]
root = "/data/files"
"#;
        let config: LockboxConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.storage.root, PathBuf::from("/data/files"));
        // Defaults
        assert_eq!(config.storage.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = LockboxConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_load_optional_distinguishes_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(LockboxConfig::load_optional(&tmp.path().join("absent.toml"))
            .unwrap()
            .is_none());

        let path = tmp.path().join("lockbox.toml");
        std::fs::write(&path, "[storage]\nchunk_size = 4096\n").unwrap();
        let config = LockboxConfig::load_optional(&path).unwrap().unwrap();
        assert_eq!(config.storage.chunk_size, 4096);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("lockbox.toml");
        std::fs::write(&path, "[storage\nroot = 1").unwrap();

        let result = LockboxConfig::load(&path);
        assert!(matches!(result, Err(LockboxError::Config(_))));
    }
}
