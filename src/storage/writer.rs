use crate::error::Result;

/// Write handle returned by `Storage::store`.
///
/// The body is streamed through [`write`](ChunkWriter::write) and the entry
/// becomes visible to `fetch` only once [`close`](ChunkWriter::close) returns
/// `Ok`. Dropping a writer without closing it commits nothing.
pub trait ChunkWriter: Send {
    /// Append one chunk of body bytes.
    fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Commit the entry.
    fn close(self: Box<Self>) -> Result<()>;

    /// Body bytes accepted so far.
    fn bytes_written(&self) -> u64;
}
