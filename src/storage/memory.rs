//! In-memory backend. Entries live as long as the store.
//!
//! Writers buffer chunks locally and publish the finished entry under the
//! store's write lock on `close()`. `fetch` copies the URL's variant list
//! under the read lock and yields from that snapshot, so it never sees a
//! half-written entry but may miss commits that land after the snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::storage::entry::{Body, CacheEntry, Discriminators, EntryMeta};
use crate::storage::writer::ChunkWriter;
use crate::storage::{Fetch, Storage};

struct StoredEntry {
    meta: EntryMeta,
    chunks: Vec<Bytes>,
}

type Variants = HashMap<Discriminators, Arc<StoredEntry>>;

/// URL → variants map and the lock guarding it. Cloning shares the map; hand
/// a clone to [`MemoryStore::with_lock`] to back two stores with one lock.
#[derive(Clone, Default)]
pub struct SharedEntries(Arc<RwLock<HashMap<String, Variants>>>);

/// Volatile store backed by a single map under one lock.
#[derive(Default)]
pub struct MemoryStore {
    data: SharedEntries,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store over an existing map and lock.
    pub fn with_lock(data: SharedEntries) -> Self {
        Self { data }
    }

    pub fn shared(&self) -> SharedEntries {
        self.data.clone()
    }

    /// URLs with at least one committed variant.
    pub fn urls(&self) -> Vec<String> {
        self.data.0.read().keys().cloned().collect()
    }

    /// Total committed variants across all URLs.
    pub fn len(&self) -> usize {
        self.data.0.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStore {
    fn store(&self, url: &str, meta: EntryMeta) -> Result<Box<dyn ChunkWriter>> {
        Ok(Box::new(MemoryChunkWriter {
            data: self.data.clone(),
            url: url.to_string(),
            meta,
            chunks: Vec::new(),
            written: 0,
        }))
    }

    fn fetch(&self, url: &str) -> Result<Fetch<'_>> {
        let snapshot: Vec<Arc<StoredEntry>> = match self.data.0.read().get(url) {
            Some(variants) => variants.values().cloned().collect(),
            None => Vec::new(),
        };
        Ok(Box::new(snapshot.into_iter().map(|e| CacheEntry {
            meta: e.meta.clone(),
            body: Body::from_chunks(e.chunks.clone()),
        })))
    }
}

struct MemoryChunkWriter {
    data: SharedEntries,
    url: String,
    meta: EntryMeta,
    chunks: Vec<Bytes>,
    written: u64,
}

impl ChunkWriter for MemoryChunkWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += chunk.len() as u64;
        self.chunks.push(Bytes::copy_from_slice(chunk));
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let MemoryChunkWriter { data, url, meta, chunks, written } = *self;
        let discriminators = meta.discriminators.clone();
        debug!(url, discriminators = %discriminators, bytes = written, "Memory entry committed");
        data.0.write()
            .entry(url)
            .or_default()
            .insert(discriminators, Arc::new(StoredEntry { meta, chunks }));
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}
