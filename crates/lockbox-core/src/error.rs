use std::io;

use thiserror::Error;

use crate::types::FileId;

pub type LockboxResult<T> = Result<T, LockboxError>;

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error("invalid key length: {len} bytes (expected 16, 24, or 32)")]
    InvalidKey { len: usize },

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("authentication failed: wrong key or corrupted data")]
    Authentication,

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("file is encrypted; a key is required")]
    KeyRequired,

    #[error("file not found: {0}")]
    NotFound(FileId),

    #[error("requester does not own this file")]
    Unauthorized,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("storage I/O error: {context}: {source}")]
    StorageIo {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("config error: {0}")]
    Config(String),
}

impl LockboxError {
    /// Wrap a filesystem error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::StorageIo {
            context: context.into(),
            source,
        }
    }

    /// Recover a typed error that travelled through an `io::Read`/`io::Write`
    /// boundary (see [`LockboxError::into_io`]). Plain I/O errors become
    /// `StorageIo` with the given context.
    pub fn from_io(err: io::Error, context: &str) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<LockboxError>())
        {
            return Self::io(context, err);
        }
        match err.into_inner().map(|inner| inner.downcast::<LockboxError>()) {
            Some(Ok(typed)) => *typed,
            Some(Err(other)) => Self::io(context, io::Error::new(io::ErrorKind::Other, other)),
            None => Self::io(context, io::Error::from(io::ErrorKind::Other)),
        }
    }

    /// Carry this error through an `io::Read`/`io::Write` boundary.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Self::StorageIo { source, .. } => source.kind(),
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_error_survives_io_boundary() {
        let err = LockboxError::Authentication.into_io();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let recovered = LockboxError::from_io(err, "reading");
        assert!(matches!(recovered, LockboxError::Authentication));
    }

    #[test]
    fn test_plain_io_error_becomes_storage_io() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        match LockboxError::from_io(err, "opening blob") {
            LockboxError::StorageIo { context, source } => {
                assert_eq!(context, "opening blob");
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_storage_io_keeps_kind_across_boundary() {
        let err = LockboxError::io("writing", io::Error::from(io::ErrorKind::WriteZero));
        let crossed = err.into_io();
        assert_eq!(crossed.kind(), io::ErrorKind::WriteZero);
        assert!(matches!(
            LockboxError::from_io(crossed, "outer"),
            LockboxError::StorageIo { .. }
        ));
    }
}
