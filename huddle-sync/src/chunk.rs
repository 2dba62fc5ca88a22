//! Chunk codec: splitting oversized values into transport-sized parts.
//!
//! A logical value `V` stored under key `K` becomes:
//! ```text
//! K                      → "<version>:<parts>"     (pointer / manifest)
//! K/_/<version>/0        → V[0 .. P]
//! K/_/<version>/1        → V[P .. 2P]
//! ...
//! K/_/<version>/<n-1>    → V[(n-1)P ..]
//! ```
//! `<version>` is the SHA-256 of `V`, so rewriting a key with a new value
//! never collides with the parts of the previous one.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Separator between a logical key and its chunk bookkeeping.
pub const CHUNK_SEPARATOR: &str = "/_/";

/// Bytes a chunk key adds on top of its logical key: separator, 64-char
/// tag, `/` and a part index of up to six digits.
pub const CHUNK_KEY_HEADROOM: usize = CHUNK_SEPARATOR.len() + 64 + 1 + 6;

/// Content-derived version identifier of a serialized value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionTag(String);

impl VersionTag {
    /// Hash a serialized value.
    pub fn of(value: &str) -> Self {
        Self(hex::encode(Sha256::digest(value.as_bytes())))
    }

    /// Accept a tag produced by another participant.
    ///
    /// Tags are opaque, but must not contain the characters the key and
    /// manifest grammar use as delimiters.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.contains('/') || raw.contains(':') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pointer-entry payload: which version is current and how many parts it has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: VersionTag,
    pub parts: usize,
}

impl Manifest {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.version, self.parts)
    }

    /// Parse a pointer value. Zero parts is never written, since even an
    /// empty value has one part.
    pub fn parse(raw: &str) -> Option<Self> {
        let (version, parts) = raw.rsplit_once(':')?;
        let parts = parts.parse().ok().filter(|&n: &usize| n > 0)?;
        Some(Self {
            version: VersionTag::parse(version)?,
            parts,
        })
    }
}

/// A parsed `<key>/_/<version>/<index>` transport key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey<'a> {
    pub key: &'a str,
    pub version: &'a str,
    pub index: usize,
}

/// Build the transport key of one part.
pub fn chunk_key(key: &str, version: &VersionTag, index: usize) -> String {
    format!("{key}{CHUNK_SEPARATOR}{version}/{index}")
}

/// Prefix shared by every chunk entry of `key`, across all versions.
pub fn chunk_prefix(key: &str) -> String {
    format!("{key}{CHUNK_SEPARATOR}")
}

/// Split a raw transport key into its chunk coordinates.
///
/// Returns `None` for pointer keys and for anything not following the grammar.
pub fn parse_chunk_key(raw: &str) -> Option<ChunkKey<'_>> {
    let (key, rest) = raw.split_once(CHUNK_SEPARATOR)?;
    let (version, index) = rest.split_once('/')?;
    if key.is_empty() || version.is_empty() {
        return None;
    }
    Some(ChunkKey {
        key,
        version,
        index: index.parse().ok()?,
    })
}

/// Whether a raw transport key is chunk bookkeeping rather than a pointer.
pub fn is_chunk_key(raw: &str) -> bool {
    raw.contains(CHUNK_SEPARATOR)
}

/// Slice `value` into parts of at most `max_part_size` bytes.
///
/// Cuts only at char boundaries; a single char wider than the limit still
/// gets its own part. An empty value yields exactly one empty part so that
/// "empty" stays distinguishable from "absent".
pub fn split(value: &str, max_part_size: usize) -> Vec<String> {
    if value.is_empty() {
        return vec![String::new()];
    }
    let max = max_part_size.max(1);
    let mut parts = Vec::with_capacity(value.len() / max + 1);
    let mut rest = value;
    while !rest.is_empty() {
        let mut cut = rest.len().min(max);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        parts.push(head.to_string());
        rest = tail;
    }
    parts
}

/// Returned when a value cannot be reassembled yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Only {available} of {expected} parts available")]
pub struct Incomplete {
    pub available: usize,
    pub expected: usize,
}

/// Concatenate the contiguous parts `0..expected_count`.
///
/// `parts` yields the parts found starting at index 0 and must stop at the
/// first gap. Fewer than `expected_count` parts is [`Incomplete`]; extra parts
/// are ignored.
pub fn join<'a, I>(parts: I, expected_count: usize) -> Result<String, Incomplete>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut value = String::new();
    let mut available = 0;
    for part in parts.into_iter().take(expected_count) {
        value.push_str(part);
        available += 1;
    }
    if available < expected_count {
        return Err(Incomplete {
            available,
            expected: expected_count,
        });
    }
    Ok(value)
}
