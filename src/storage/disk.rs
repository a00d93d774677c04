//! Disk backend — content-addressed files under `base_path/`.
//!
//! ## Layout
//!
//! ```text
//! base_path/
//!   <h[0:2]>/<h[2:]>/            h = hex(sha256(url))
//!     <variant>                  metadata, see `codec`
//!     <variant>.body             raw body bytes
//!     .<variant>.<tag>.meta.tmp  pending metadata (never listed)
//!     .<variant>.<tag>.body.tmp  pending body (never listed)
//! ```
//!
//! `variant` is `hex(sha256(canonical discriminator bytes))`, identical in
//! every process.
//!
//! `store()` writes the metadata to a temp file before handing out the writer;
//! the body streams into its own temp file. `close()` renames both into place
//! while holding the entry's lock, and `fetch` reads metadata and opens the
//! body under that same lock. A reader thus sees either the old pair or the
//! new one, and an open body handle keeps the inode it opened.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::storage::codec;
use crate::storage::entry::{Body, CacheEntry, Discriminators, EntryMeta};
use crate::storage::locks::KeyedLocks;
use crate::storage::writer::ChunkWriter;
use crate::storage::{Fetch, Storage};

// ─────────────────────────────── constants ───────────────────────────────────

pub const BODY_SUFFIX: &str = ".body";
const TMP_SUFFIX: &str = ".tmp";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

// ─────────────────────────────── DiskStore ───────────────────────────────────

/// Persistent store rooted at `base_path`.
pub struct DiskStore {
    base_path: PathBuf,
    locks: Arc<KeyedLocks>,
}

impl DiskStore {
    /// Open (or create) a store rooted at `base_path` with its own lock
    /// registry.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_locks(base_path, Arc::new(KeyedLocks::new()))
    }

    /// Open a store sharing `locks` with other instances over the same path.
    pub fn with_locks(base_path: impl Into<PathBuf>, locks: Arc<KeyedLocks>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).map_err(|e| StoreError::write(&base_path, e))?;
        let store = Self { base_path, locks };
        let stale = store.temp_files()?;
        if !stale.is_empty() {
            warn!(
                path = ?store.base_path,
                count = stale.len(),
                "Found leftover temp files from interrupted writes"
            );
        }
        info!(path = ?store.base_path, "Disk store opened");
        Ok(store)
    }

    /// Pending-write temp files anywhere under the base path. Outside of a
    /// live writer these are leftovers of an interrupted process.
    pub fn temp_files(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for fan in read_subdirs(&self.base_path)? {
            for dir in read_subdirs(&fan)? {
                for dirent in fs::read_dir(&dir).map_err(|e| StoreError::read(&dir, e))? {
                    let dirent = dirent.map_err(|e| StoreError::read(&dir, e))?;
                    let name = dirent.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with('.') && name.ends_with(TMP_SUFFIX) {
                        found.push(dirent.path());
                    }
                }
            }
        }
        Ok(found)
    }

    /// Delete leftover temp files. Only safe while no writer, in this or any
    /// other process, is open on the base path.
    pub fn remove_temp_files(&self) -> Result<usize> {
        let stale = self.temp_files()?;
        for path in &stale {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::write(path, e)),
            }
        }
        if !stale.is_empty() {
            info!(path = ?self.base_path, removed = stale.len(), "Leftover temp files removed");
        }
        Ok(stale.len())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding every variant of `url`.
    pub fn dirname(&self, url: &str) -> PathBuf {
        let h = codec::hash_hex(url.as_bytes());
        self.base_path.join(&h[..2]).join(&h[2..])
    }

    /// Metadata file of one variant. The body sits next to it with
    /// [`BODY_SUFFIX`] appended.
    pub fn entry_path(&self, url: &str, discriminators: &Discriminators) -> PathBuf {
        self.dirname(url).join(codec::variant_key(discriminators))
    }
}

fn body_path_for(meta_path: &Path) -> PathBuf {
    let mut s = meta_path.as_os_str().to_owned();
    s.push(BODY_SUFFIX);
    PathBuf::from(s)
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for dirent in fs::read_dir(dir).map_err(|e| StoreError::read(dir, e))? {
        let dirent = dirent.map_err(|e| StoreError::read(dir, e))?;
        if dirent.file_type().map_err(|e| StoreError::read(dirent.path(), e))?.is_dir() {
            dirs.push(dirent.path());
        }
    }
    Ok(dirs)
}

fn lock_key(meta_path: &Path) -> String {
    meta_path.to_string_lossy().into_owned()
}

impl Storage for DiskStore {
    fn store(&self, url: &str, meta: EntryMeta) -> Result<Box<dyn ChunkWriter>> {
        let dir = self.dirname(url);
        fs::create_dir_all(&dir).map_err(|e| StoreError::write(&dir, e))?;

        let key = codec::variant_key(&meta.discriminators);
        let final_meta = dir.join(&key);
        let tag = format!("{}-{}", std::process::id(), TMP_SEQ.fetch_add(1, Ordering::Relaxed));
        let tmp_meta = dir.join(format!(".{key}.{tag}.meta{TMP_SUFFIX}"));
        let tmp_body = dir.join(format!(".{key}.{tag}.body{TMP_SUFFIX}"));

        let encoded = codec::encode_meta(&meta).map_err(|e| StoreError::write(&tmp_meta, e))?;
        if let Err(e) = write_synced(&tmp_meta, &encoded) {
            let _ = fs::remove_file(&tmp_meta);
            return Err(StoreError::write(&tmp_meta, e));
        }

        let body = match File::create(&tmp_body) {
            Ok(f) => BufWriter::new(f),
            Err(e) => {
                let _ = fs::remove_file(&tmp_meta);
                return Err(StoreError::write(&tmp_body, e));
            }
        };

        debug!(url, variant = %key, "Disk entry pending");

        Ok(Box::new(DiskChunkWriter {
            locks: self.locks.clone(),
            url: url.to_string(),
            final_body: body_path_for(&final_meta),
            final_meta,
            tmp_meta,
            tmp_body,
            body: Some(body),
            written: 0,
            committed: false,
        }))
    }

    fn fetch(&self, url: &str) -> Result<Fetch<'_>> {
        let dir = self.dirname(url);
        let entries = match fs::read_dir(&dir) {
            Ok(rd) => Some(rd),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::read(&dir, e)),
        };
        Ok(Box::new(DiskFetch { locks: self.locks.as_ref(), entries }))
    }
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut f = File::create(path)?;
    f.write_all(data)?;
    f.sync_data()
}

// ─────────────────────────────── writer ──────────────────────────────────────

struct DiskChunkWriter {
    locks: Arc<KeyedLocks>,
    url: String,
    final_meta: PathBuf,
    final_body: PathBuf,
    tmp_meta: PathBuf,
    tmp_body: PathBuf,
    body: Option<BufWriter<File>>,
    written: u64,
    committed: bool,
}

impl DiskChunkWriter {
    fn finish_body(&mut self) -> Result<()> {
        let Some(mut body) = self.body.take() else {
            return Ok(());
        };
        body.flush().map_err(|e| StoreError::write(&self.tmp_body, e))?;
        let file = body
            .into_inner()
            .map_err(|e| StoreError::write(&self.tmp_body, e.into_error()))?;
        file.sync_data().map_err(|e| StoreError::write(&self.tmp_body, e))
    }

    fn publish(&mut self) -> Result<()> {
        let lock = self.locks.acquire(&lock_key(&self.final_meta));
        fs::rename(&self.tmp_body, &self.final_body)
            .map_err(|e| StoreError::write(&self.final_body, e))?;
        if let Err(e) = fs::rename(&self.tmp_meta, &self.final_meta) {
            // The new body is already in place; drop the stale metadata
            // rather than pair it with the wrong body.
            let _ = fs::remove_file(&self.final_meta);
            return Err(StoreError::write(&self.final_meta, e));
        }
        self.committed = true;
        lock.release()
    }
}

impl ChunkWriter for DiskChunkWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let body = self.body.as_mut().ok_or_else(|| {
            StoreError::write(&self.tmp_body, std::io::Error::other("body already finished"))
        })?;
        body.write_all(chunk).map_err(|e| StoreError::write(&self.tmp_body, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.finish_body()?;
        self.publish()?;
        debug!(url = %self.url, path = ?self.final_meta, bytes = self.written, "Disk entry committed");
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl Drop for DiskChunkWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.body.take());
        let _ = fs::remove_file(&self.tmp_body);
        let _ = fs::remove_file(&self.tmp_meta);
        debug!(url = %self.url, path = ?self.final_meta, "Uncommitted disk entry discarded");
    }
}

// ─────────────────────────────── fetch ───────────────────────────────────────

struct DiskFetch<'a> {
    locks: &'a KeyedLocks,
    entries: Option<fs::ReadDir>,
}

impl DiskFetch<'_> {
    fn load(&self, meta_path: &Path, name: &str) -> Result<CacheEntry> {
        let lock = self.locks.acquire(&lock_key(meta_path));

        let data = fs::read(meta_path).map_err(|e| StoreError::read(meta_path, e))?;
        let meta = codec::decode_meta(&data, meta_path)?;
        if codec::variant_key(&meta.discriminators) != name {
            return Err(StoreError::corrupt(meta_path, "discriminators do not match file name"));
        }
        let body_path = body_path_for(meta_path);
        let body = File::open(&body_path).map_err(|e| StoreError::read(&body_path, e))?;

        lock.release()?;
        Ok(CacheEntry { meta, body: Body::from_file(body) })
    }
}

impl Iterator for DiskFetch<'_> {
    type Item = CacheEntry;

    fn next(&mut self) -> Option<CacheEntry> {
        loop {
            let dirent = match self.entries.as_mut()?.next()? {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };
            let file_name = dirent.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') || name.ends_with(BODY_SUFFIX) {
                continue;
            }
            let path = dirent.path();
            match self.load(&path, name) {
                Ok(entry) => return Some(entry),
                Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable cache entry"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(disc: &[&str]) -> EntryMeta {
        EntryMeta::new(Discriminators::new(disc.iter().copied()), 0, 200)
    }

    #[test]
    fn dirname_fans_out_on_url_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let h = codec::hash_hex(b"http://x/a");
        assert_eq!(store.dirname("http://x/a"), dir.path().join(&h[..2]).join(&h[2..]));
        assert_eq!(
            store.entry_path("http://x/a", &Discriminators::empty()),
            store.dirname("http://x/a").join(codec::variant_key(&Discriminators::empty()))
        );
    }

    #[test]
    fn pending_write_leaves_only_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let mut w = store.store("url", meta(&[])).unwrap();
        w.write(b"partial").unwrap();

        assert_eq!(store.fetch("url").unwrap().count(), 0);
        let names: Vec<String> = fs::read_dir(store.dirname("url"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.starts_with('.') && n.ends_with(TMP_SUFFIX)));

        w.close().unwrap();
        assert_eq!(store.fetch("url").unwrap().count(), 1);
    }

    #[test]
    fn dropped_writer_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let mut w = store.store("url", meta(&[])).unwrap();
        w.write(b"abc").unwrap();
        drop(w);
        assert_eq!(fs::read_dir(store.dirname("url")).unwrap().count(), 0);
        assert_eq!(store.fetch("url").unwrap().count(), 0);
    }

    #[test]
    fn blocked_directory_fails_with_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let target = store.dirname("url");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, b"not a directory").unwrap();

        let err = store.store("url", meta(&[])).err().expect("store must fail");
        match err {
            StoreError::Write { path, .. } => assert_eq!(path, target),
            other => panic!("expected a write error, got {other:?}"),
        }
    }

    #[test]
    fn abandoned_replacement_keeps_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let mut w = store.store("url", meta(&["gzip"])).unwrap();
        w.write(b"old").unwrap();
        w.close().unwrap();

        let mut replacement = store
            .store("url", EntryMeta::new(Discriminators::new(["gzip"]), 0, 404))
            .unwrap();
        replacement.write(b"new").unwrap();
        drop(replacement);

        let entries: Vec<_> = store.fetch("url").unwrap().collect();
        assert_eq!(entries.len(), 1);
        let entry = entries.into_iter().next().unwrap();
        assert_eq!(entry.meta.status, 200);
        assert_eq!(entry.body.into_bytes().unwrap(), b"old");
        assert!(store.temp_files().unwrap().is_empty());
    }

    #[test]
    fn leftover_temp_files_are_found_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).unwrap();
            store.store("url", meta(&[])).unwrap().close().unwrap();
            let leftover = store.dirname("url").join(format!(".abc.1-0.body{TMP_SUFFIX}"));
            fs::write(&leftover, b"interrupted").unwrap();
        }

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(store.temp_files().unwrap().len(), 1);
        assert_eq!(store.remove_temp_files().unwrap(), 1);
        assert!(store.temp_files().unwrap().is_empty());
        assert_eq!(store.fetch("url").unwrap().count(), 1);
    }

    #[test]
    fn corrupt_metadata_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.store("url", meta(&["good"])).unwrap().close().unwrap();
        store.store("url", meta(&["bad"])).unwrap().close().unwrap();
        fs::write(store.entry_path("url", &Discriminators::new(["bad"])), b"garbage").unwrap();

        let entries: Vec<_> = store.fetch("url").unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].meta.discriminators, Discriminators::new(["good"]));
        assert!(store.locks.is_empty());
    }

    #[test]
    fn missing_body_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.store("url", meta(&[])).unwrap().close().unwrap();
        let path = store.entry_path("url", &Discriminators::empty());
        fs::remove_file(body_path_for(&path)).unwrap();
        assert_eq!(store.fetch("url").unwrap().count(), 0);
    }

    #[test]
    fn renamed_metadata_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.store("url", meta(&["a"])).unwrap().close().unwrap();
        let a = store.entry_path("url", &Discriminators::new(["a"]));
        let b = store.entry_path("url", &Discriminators::new(["b"]));
        fs::rename(&a, &b).unwrap();
        fs::rename(body_path_for(&a), body_path_for(&b)).unwrap();
        assert_eq!(store.fetch("url").unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn open_body_survives_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let mut w = store.store("url", meta(&[])).unwrap();
        w.write(b"old body").unwrap();
        w.close().unwrap();

        let old = store.fetch("url").unwrap().next().unwrap();

        let mut w = store.store("url", meta(&[])).unwrap();
        w.write(b"new body").unwrap();
        w.close().unwrap();

        assert_eq!(old.body.into_bytes().unwrap(), b"old body");
        let new = store.fetch("url").unwrap().next().unwrap();
        assert_eq!(new.body.into_bytes().unwrap(), b"new body");
    }
}
