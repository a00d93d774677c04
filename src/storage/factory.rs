// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use tracing::info;

use crate::config::{Backend, StorageConfig};
use crate::error::{Result, StoreError};
use crate::storage::disk::DiskStore;
use crate::storage::memory::MemoryStore;
use crate::storage::Storage;

/// Build the backend selected by `config`.
pub fn make_storage(config: &StorageConfig) -> Result<Box<dyn Storage>> {
    config.validate()?;
    match config.backend {
        Backend::Memory => {
            info!(backend = "memory", "Storage created");
            Ok(Box::new(MemoryStore::new()))
        }
        Backend::Disk => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| StoreError::Config("storage.path is required for the disk backend".into()))?;
            info!(backend = "disk", path = ?path, "Storage created");
            Ok(Box::new(DiskStore::open(path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Discriminators, EntryMeta};

    #[test]
    fn builds_memory_store() {
        let store = make_storage(&StorageConfig::memory()).unwrap();
        assert_eq!(store.fetch("url").unwrap().count(), 0);
    }

    #[test]
    fn builds_disk_store_under_path() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let store = make_storage(&StorageConfig::disk(&root)).unwrap();
        store
            .store("url", EntryMeta::new(Discriminators::empty(), 0, 200))
            .unwrap()
            .close()
            .unwrap();
        assert!(root.is_dir());
        assert_eq!(store.fetch("url").unwrap().count(), 1);
    }

    #[test]
    fn disk_without_path_fails() {
        let cfg = StorageConfig { backend: Backend::Disk, path: None };
        assert!(matches!(make_storage(&cfg), Err(StoreError::Config(_))));
    }
}
