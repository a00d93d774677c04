// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cache entry model shared by both backends.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};

use bytes::Bytes;
use serde_json::Value;

/// Ordered tuple of values that tells variants of one URL apart
/// (negotiated encoding, a cookie, ...). The empty tuple is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Discriminators(Vec<String>);

impl Discriminators {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for Discriminators {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}

impl fmt::Display for Discriminators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Backend- or caller-defined auxiliary fields.
pub type Extras = BTreeMap<String, Value>;

/// Everything about a cached response except its body.
///
/// `expires` and `status` are stored and returned untouched; freshness is the
/// caller's business.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryMeta {
    pub discriminators: Discriminators,
    pub expires: i64,
    pub status: u16,
    /// Order-preserving, duplicates allowed.
    pub headers: Vec<(String, String)>,
    pub extras: Extras,
}

impl EntryMeta {
    pub fn new(discriminators: Discriminators, expires: i64, status: u16) -> Self {
        Self { discriminators, expires, status, headers: Vec::new(), extras: Extras::new() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

/// One stored variant as yielded by `fetch`.
#[derive(Debug)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub body: Body,
}

impl CacheEntry {
    pub fn discriminators(&self) -> &Discriminators {
        &self.meta.discriminators
    }
}

/// Response body, readable once.
pub enum Body {
    /// Chunks exactly as they were written.
    Memory(ChunkCursor),
    /// Open handle on the body file. Keeps reading the committed inode even
    /// if the entry is replaced meanwhile.
    Disk(BufReader<File>),
}

impl Body {
    pub(crate) fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Body::Memory(ChunkCursor { chunks, idx: 0, pos: 0 })
    }

    pub(crate) fn from_file(file: File) -> Self {
        Body::Disk(BufReader::new(file))
    }

    /// The written chunks, for memory bodies.
    pub fn chunks(&self) -> Option<&[Bytes]> {
        match self {
            Body::Memory(c) => Some(&c.chunks),
            Body::Disk(_) => None,
        }
    }

    /// Drain the remaining body into one buffer.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Body::Memory(c) => c.read(buf),
            Body::Disk(r) => r.read(buf),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Memory(c) => f.debug_struct("Body::Memory").field("chunks", &c.chunks.len()).finish(),
            Body::Disk(_) => f.write_str("Body::Disk"),
        }
    }
}

/// Read cursor over a list of chunks.
pub struct ChunkCursor {
    chunks: Vec<Bytes>,
    idx: usize,
    pos: usize,
}

impl Read for ChunkCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(chunk) = self.chunks.get(self.idx) {
            let rest = &chunk[self.pos..];
            if rest.is_empty() {
                self.idx += 1;
                self.pos = 0;
                continue;
            }
            let n = rest.len().min(buf.len());
            buf[..n].copy_from_slice(&rest[..n]);
            self.pos += n;
            return Ok(n);
        }
        Ok(0)
    }
}
