//! Metadata file format and content-addressing helpers.
//!
//! ## Metadata layout (all integers big-endian)
//!
//! ```text
//! magic      : [u8;8]  = b"ACCMETA\0"
//! version    : u16     = 1
//! disc_count : u32     then per value:  len u32 + UTF-8
//! expires    : i64
//! status     : u16
//! hdr_count  : u32     then per header: len u32 + name, len u32 + value
//! extras_len : u32     then a JSON object (UTF-8)
//! ```
//!
//! Variant file names hash a fixed canonical form of the discriminator tuple
//! (see [`variant_key`]), so equal tuples always map to the same file.

use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};
use crate::storage::entry::{Discriminators, EntryMeta, Extras};

// ─────────────────────────────── constants ───────────────────────────────────

pub const META_MAGIC: &[u8; 8] = b"ACCMETA\0";
pub const META_VERSION: u16 = 1;

// ─────────────────────────────── hashing ─────────────────────────────────────

/// Lowercase hex SHA-256 of `data`.
pub fn hash_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// File name of the variant identified by `discriminators`.
///
/// The hashed canonical form is the value count followed by each value, all
/// prefixed with `u64` big-endian lengths.
pub fn variant_key(discriminators: &Discriminators) -> String {
    let mut hasher = Sha256::new();
    hasher.update((discriminators.values().len() as u64).to_be_bytes());
    for v in discriminators.values() {
        hasher.update((v.len() as u64).to_be_bytes());
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ─────────────────────────────── encode ──────────────────────────────────────

/// Serialize `meta`. Oversized fields fail with `InvalidInput`.
pub fn encode_meta(meta: &EntryMeta) -> io::Result<Vec<u8>> {
    let extras = serde_json::to_vec(&meta.extras).map_err(io::Error::other)?;

    let mut buf = Vec::with_capacity(64 + extras.len());
    write_meta(&mut buf, meta, &extras)?;
    Ok(buf)
}

fn write_meta<W: Write>(w: &mut W, meta: &EntryMeta, extras: &[u8]) -> io::Result<()> {
    w.write_all(META_MAGIC)?;
    w.write_u16::<BigEndian>(META_VERSION)?;
    write_len(w, meta.discriminators.values().len())?;
    for v in meta.discriminators.values() {
        write_str(w, v)?;
    }
    w.write_i64::<BigEndian>(meta.expires)?;
    w.write_u16::<BigEndian>(meta.status)?;
    write_len(w, meta.headers.len())?;
    for (name, value) in &meta.headers {
        write_str(w, name)?;
        write_str(w, value)?;
    }
    write_len(w, extras.len())?;
    w.write_all(extras)
}

fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("field length {len} exceeds u32"))
    })?;
    w.write_u32::<BigEndian>(len)
}

fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_len(w, s.len())?;
    w.write_all(s.as_bytes())
}

// ─────────────────────────────── decode ──────────────────────────────────────

/// Decode a metadata file. `path` only labels errors.
pub fn decode_meta(data: &[u8], path: &Path) -> Result<EntryMeta> {
    let corrupt = |reason: String| StoreError::corrupt(path, reason);
    let mut r = Cursor::new(data);

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(|_| corrupt("truncated header".into()))?;
    if &magic != META_MAGIC {
        return Err(corrupt("bad magic".into()));
    }
    let version = r.read_u16::<BigEndian>().map_err(|_| corrupt("truncated header".into()))?;
    if version != META_VERSION {
        return Err(corrupt(format!("unsupported version {version}")));
    }

    let count = read_len(&mut r, path)?;
    let mut values = Vec::new();
    for _ in 0..count {
        values.push(read_str(&mut r, path)?);
    }
    let expires = r.read_i64::<BigEndian>().map_err(|_| corrupt("truncated expires".into()))?;
    let status = r.read_u16::<BigEndian>().map_err(|_| corrupt("truncated status".into()))?;

    let hdr_count = read_len(&mut r, path)?;
    let mut headers = Vec::new();
    for _ in 0..hdr_count {
        let name = read_str(&mut r, path)?;
        let value = read_str(&mut r, path)?;
        headers.push((name, value));
    }

    let extras_raw = read_bytes(&mut r, path)?;
    let extras: Extras = serde_json::from_slice(&extras_raw)
        .map_err(|e| corrupt(format!("extras: {e}")))?;

    if (r.position() as usize) != data.len() {
        return Err(corrupt(format!("{} trailing bytes", data.len() - r.position() as usize)));
    }

    Ok(EntryMeta {
        discriminators: Discriminators::from(values),
        expires,
        status,
        headers,
        extras,
    })
}

fn read_len(r: &mut Cursor<&[u8]>, path: &Path) -> Result<usize> {
    let len = r
        .read_u32::<BigEndian>()
        .map_err(|_| StoreError::corrupt(path, "truncated length"))? as usize;
    let remaining = r.get_ref().len() - r.position() as usize;
    // Every counted item takes at least one byte; anything larger is garbage.
    if len > remaining {
        return Err(StoreError::corrupt(path, format!("length {len} exceeds {remaining} remaining bytes")));
    }
    Ok(len)
}

fn read_bytes(r: &mut Cursor<&[u8]>, path: &Path) -> Result<Vec<u8>> {
    let len = read_len(r, path)?;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|_| StoreError::corrupt(path, "truncated field"))?;
    Ok(buf)
}

fn read_str(r: &mut Cursor<&[u8]>, path: &Path) -> Result<String> {
    String::from_utf8(read_bytes(r, path)?).map_err(|_| StoreError::corrupt(path, "invalid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntryMeta {
        EntryMeta::new(Discriminators::new(["gzip", "lang=fr"]), 1_700_000_000, 203)
            .header("Content-Type", "text/html")
            .header("Vary", "Accept-Encoding")
            .header("Vary", "Cookie")
            .extra("etag", "\"abc\"")
            .extra("size", 42)
    }

    #[test]
    fn decodes_what_it_encodes() {
        let meta = sample();
        let bytes = encode_meta(&meta).unwrap();
        assert_eq!(decode_meta(&bytes, Path::new("m")).unwrap(), meta);
    }

    #[test]
    fn variant_key_is_stable_and_distinct() {
        let a = Discriminators::new(["gzip"]);
        assert_eq!(variant_key(&a), variant_key(&Discriminators::new(["gzip"])));
        assert_ne!(variant_key(&a), variant_key(&Discriminators::empty()));
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        assert_ne!(
            variant_key(&Discriminators::new(["ab", "c"])),
            variant_key(&Discriminators::new(["a", "bc"]))
        );
        assert_eq!(variant_key(&a).len(), 64);
    }

    #[test]
    fn hash_hex_matches_known_digest() {
        assert_eq!(
            hash_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        let err = write_len(&mut buf, u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
        write_len(&mut buf, u32::MAX as usize).unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode_meta(&sample()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode_meta(&bytes, Path::new("m")), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode_meta(&sample()).unwrap();
        bytes[9] = 99;
        let err = decode_meta(&bytes, Path::new("m")).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn rejects_truncation_and_trailing_bytes() {
        let bytes = encode_meta(&sample()).unwrap();
        for cut in [4, 12, bytes.len() / 2, bytes.len() - 1] {
            assert!(decode_meta(&bytes[..cut], Path::new("m")).is_err(), "cut at {cut}");
        }
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(decode_meta(&longer, Path::new("m")).is_err());
    }

    #[test]
    fn rejects_non_object_extras() {
        let mut bytes = encode_meta(&EntryMeta::new(Discriminators::empty(), 0, 200)).unwrap();
        // Replace the trailing "{}" with "[]".
        let n = bytes.len();
        bytes[n - 2] = b'[';
        bytes[n - 1] = b']';
        assert!(decode_meta(&bytes, Path::new("m")).is_err());
    }
}
