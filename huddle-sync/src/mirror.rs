//! Local mirror of the shared document.
//!
//! The mirror stores raw transport entries (pointers and chunks) exactly as
//! the transport does and derives the logical view on read:
//!
//! ```text
//! raw entries                         logical view
//! ───────────────────────────────     ─────────────────────
//! a/photo            → "9f2c…:3"
//! a/photo/_/9f2c…/0  → "<8192>"   ─►  a/photo → "<20000>"
//! a/photo/_/9f2c…/1  → "<8192>"
//! a/photo/_/9f2c…/2  → "<3616>"
//! b/available        → "e3b0…:1"
//! b/available/_/e3b0…/0 → "true"  ─►  b/available → "true"
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::chunk::{self, chunk_key, chunk_prefix, Manifest, VersionTag};

/// Raw entries a local mutation produced, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChange {
    pub updates: Vec<(String, String)>,
    pub removes: Vec<String>,
}

impl RawChange {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removes.is_empty()
    }
}

/// Logical keys whose observable state changed while applying raw entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalChange {
    /// Keys that became readable or now read a different value.
    pub added: BTreeMap<String, String>,
    /// Keys whose pointer disappeared while they were readable.
    pub removed: BTreeSet<String>,
}

impl LogicalChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalMirror {
    entries: BTreeMap<String, String>,
}

impl LocalMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a full transport snapshot.
    pub fn from_snapshot(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Store `value` under `key`, chunked into parts of `part_size` bytes.
    ///
    /// The returned change writes every part before the pointer and then
    /// removes parts of superseded versions, so a peer applying it in order
    /// never sees the pointer ahead of its parts.
    pub fn write(&mut self, key: &str, value: &str, part_size: usize) -> RawChange {
        let version = VersionTag::of(value);
        let parts = chunk::split(value, part_size);
        let manifest = Manifest {
            version: version.clone(),
            parts: parts.len(),
        };

        let mut updates: Vec<(String, String)> = parts
            .into_iter()
            .enumerate()
            .map(|(index, part)| (chunk_key(key, &version, index), part))
            .collect();
        updates.push((key.to_string(), manifest.encode()));

        let fresh: BTreeSet<&str> = updates.iter().map(|(k, _)| k.as_str()).collect();
        let removes: Vec<String> = self
            .chunk_keys(key)
            .into_iter()
            .filter(|k| !fresh.contains(k.as_str()))
            .collect();

        for stale in &removes {
            self.entries.remove(stale);
        }
        for (k, v) in &updates {
            self.entries.insert(k.clone(), v.clone());
        }

        RawChange { updates, removes }
    }

    /// Drop `key` and all of its parts. The pointer goes first so peers stop
    /// reading the value as soon as the first delta lands.
    pub fn remove(&mut self, key: &str) -> RawChange {
        let removes = self.raw_keys_of(key);
        for raw in &removes {
            self.entries.remove(raw);
        }
        RawChange {
            updates: Vec::new(),
            removes,
        }
    }

    /// Raw entries stored for `key`, in the order [`LocalMirror::remove`]
    /// drops them: pointer first, then every part.
    pub fn raw_keys_of(&self, key: &str) -> Vec<String> {
        let mut keys = Vec::new();
        if self.entries.contains_key(key) {
            keys.push(key.to_string());
        }
        keys.extend(self.chunk_keys(key));
        keys
    }

    /// Stitched value of `key`, or `None` while any part is missing.
    pub fn read(&self, key: &str) -> Option<String> {
        let manifest = Manifest::parse(self.entries.get(key)?)?;
        let parts = (0..manifest.parts)
            .map_while(|index| self.entries.get(&chunk_key(key, &manifest.version, index)))
            .map(String::as_str);
        chunk::join(parts, manifest.parts).ok()
    }

    /// Logical keys that currently read a value, sorted.
    pub fn keys(&self) -> BTreeSet<String> {
        self.pointer_keys()
            .into_iter()
            .filter(|k| self.read(k).is_some())
            .collect()
    }

    /// Every logical key with a pointer entry, readable or not.
    pub fn pointer_keys(&self) -> BTreeSet<String> {
        self.entries
            .keys()
            .filter(|k| !chunk::is_chunk_key(k))
            .cloned()
            .collect()
    }

    /// Logical keys of every raw entry, including parts whose pointer is gone.
    pub fn all_logical_keys(&self) -> BTreeSet<String> {
        self.entries.keys().map(|k| logical_key(k).to_string()).collect()
    }

    /// All readable logical values.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.pointer_keys()
            .into_iter()
            .filter_map(|k| self.read(&k).map(|v| (k, v)))
            .collect()
    }

    /// Apply raw entries received from other participants and report which
    /// logical keys changed observably.
    ///
    /// Removals are applied before additions. Applying the same entries twice
    /// reports nothing the second time.
    pub fn apply_external<'a, A, R>(&mut self, added: A, removed: R) -> LogicalChange
    where
        A: IntoIterator<Item = (&'a str, &'a str)>,
        R: IntoIterator<Item = &'a str>,
    {
        let added: Vec<(&str, &str)> = added.into_iter().collect();
        let removed: Vec<&str> = removed.into_iter().collect();

        let touched: BTreeSet<String> = added
            .iter()
            .map(|(k, _)| *k)
            .chain(removed.iter().copied())
            .map(|raw| logical_key(raw).to_string())
            .collect();
        let before: BTreeMap<&str, Option<String>> =
            touched.iter().map(|k| (k.as_str(), self.read(k))).collect();

        for raw in &removed {
            self.entries.remove(*raw);
        }
        for (raw, value) in &added {
            self.entries.insert(raw.to_string(), value.to_string());
        }

        let mut change = LogicalChange::default();
        for (key, previous) in before {
            match (previous, self.read(key)) {
                (previous, Some(current)) if previous.as_ref() != Some(&current) => {
                    change.added.insert(key.to_string(), current);
                }
                (Some(_), None) if !self.entries.contains_key(key) => {
                    change.removed.insert(key.to_string());
                }
                (_, None) if self.entries.contains_key(key) => {
                    log::debug!("Key '{key}' is waiting for missing parts");
                }
                _ => {}
            }
        }
        change
    }

    /// Raw entry lookup.
    pub fn raw_get(&self, raw_key: &str) -> Option<&str> {
        self.entries.get(raw_key).map(String::as_str)
    }

    /// Number of raw entries held.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }

    /// Chunk keys of every version currently stored for `key`.
    fn chunk_keys(&self, key: &str) -> Vec<String> {
        let prefix = chunk_prefix(key);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Logical key a raw transport key belongs to.
fn logical_key(raw: &str) -> &str {
    chunk::parse_chunk_key(raw).map_or(raw, |c| c.key)
}
