//! lockbox-engine: the file engine and its metadata collaborator
//!
//! `FileEngine` ties the pieces together: names are sanitized into an
//! owner-scoped layout, content is published atomically (and encrypted when
//! the caller supplies a key), and every read or mutation is checked against
//! the record's owner before any bytes are touched.

pub mod engine;
pub mod metadata;

pub use engine::{FileEngine, PlaintextStream, Retrieved, StoreRequest};
pub use metadata::{JsonMetadataStore, MemoryMetadataStore, MetadataStore};
