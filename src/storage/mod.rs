// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage subsystem — entry model, keyed locks, memory and disk backends.

pub mod codec;
pub mod disk;
pub mod entry;
pub mod factory;
pub mod locks;
pub mod memory;
pub mod writer;

pub use disk::DiskStore;
pub use entry::{Body, CacheEntry, Discriminators, EntryMeta, Extras};
pub use factory::make_storage;
pub use locks::{KeyedLocks, LockHandle};
pub use memory::MemoryStore;
pub use writer::ChunkWriter;

use crate::error::Result;

/// Lazy sequence of every stored variant of one URL, in no particular order.
pub type Fetch<'a> = Box<dyn Iterator<Item = CacheEntry> + Send + 'a>;

/// A response cache backend.
pub trait Storage: Send + Sync {
    /// Start storing a variant of `url`. The returned writer receives the
    /// body; closing it replaces any previous entry with the same
    /// discriminators.
    fn store(&self, url: &str, meta: EntryMeta) -> Result<Box<dyn ChunkWriter>>;

    /// All committed variants of `url`. An unknown URL yields nothing.
    fn fetch(&self, url: &str) -> Result<Fetch<'_>>;
}
