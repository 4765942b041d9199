//! lockbox-storage: where stored bytes live and how they get there
//!
//! Every file is published whole or not at all: content is staged in a
//! `.lockbox-staging-*` file next to its destination and renamed into place.

pub mod atomic;
pub mod health;
pub mod layout;

pub use atomic::{
    sweep_staging, sweep_staging_in, AtomicWriter, Published, DEFAULT_STAGING_MAX_AGE,
    STAGING_PREFIX,
};
pub use health::{check_root, is_healthy};
pub use layout::{sanitize_name, ResolvedPath, StorageLayout};
