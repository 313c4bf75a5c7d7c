//! Durable storage for the control plane
//!
//! Two physically separate SQLite files:
//! - the config store (`ConfigStore`), owned and written by this crate
//! - the operational sensor database (`OperationalSource`), owned by the
//!   producer and only ever opened read-only
//!
//! `same_storage` backs the startup check that keeps them apart.

pub mod config_store;
pub mod handle;
pub mod operational;
pub mod retry;

pub use config_store::ConfigStore;
pub use handle::{HandleError, ReadOnlyHandle, ReadWriteHandle};
pub use operational::{
    AccessMode, ColumnInfo, OperationalQuery, OperationalSource, SortOrder, TableInfo, TableQuery,
};
pub use retry::RetryPolicy;

use std::path::{Path, PathBuf};

/// Best-effort absolute, symlink-free form of `path`. Files that do not exist
/// yet are resolved through their parent directory.
pub fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// True when both paths name the same storage object: identical resolved
/// paths, or (on unix) the same device and inode, which also catches hard
/// links.
pub fn same_storage(a: &Path, b: &Path) -> bool {
    if resolve_path(a) == resolve_path(b) {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let (Ok(ma), Ok(mb)) = (std::fs::metadata(a), std::fs::metadata(b)) {
            return ma.dev() == mb.dev() && ma.ino() == mb.ino();
        }
    }
    false
}
