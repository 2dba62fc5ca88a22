//! Logical key validation and the typed key schema.
//!
//! Keys are `/`-separated paths whose first segment names the owning
//! participant (or a shared scope such as `room`). Collaborators never match
//! on raw suffixes: a key is parsed once into a [`ResourceKey`] and callers
//! branch on its [`Resource`] variant.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::CHUNK_SEPARATOR;
use crate::error::{SyncError, SyncResult};

/// Check that `key` can be stored as a logical key.
///
/// Rejects empty keys, empty segments and the `_` segment reserved for chunk
/// bookkeeping.
pub fn validate_key(key: &str) -> SyncResult<()> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.contains(CHUNK_SEPARATOR) || key.split('/').any(|s| s == "_") {
        Some("contains the reserved '_' segment")
    } else if key.split('/').any(str::is_empty) {
        Some("contains an empty segment")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SyncError::MalformedKey {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// First path segment of a key.
pub fn owner_of(key: &str) -> &str {
    key.split('/').next().unwrap_or(key)
}

/// Whether `key` belongs to `owner`.
pub fn is_owned_by(key: &str, owner: &str) -> bool {
    owner_of(key) == owner
}

/// Identity of a participant, used as the first key segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Kind of per-participant state stored under a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// `<owner>/photo`: latest snapshot image.
    Photo,
    /// `<owner>/avatar`
    Avatar,
    /// `<owner>/available`: whether the owner accepts conversations.
    Available,
    /// `<owner>/present`: whether the owner is at their desk.
    Present,
    /// `<owner>/hanging_with`: ids the owner is currently talking to.
    HangingWith,
    /// `<owner>/requests/<target>`: owner asked `target` to talk.
    Request { target: String },
    /// Anything else, kept as the path after the owner.
    Other(String),
}

impl Resource {
    /// Variant name without payload, for filtering.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Photo => ResourceKind::Photo,
            Resource::Avatar => ResourceKind::Avatar,
            Resource::Available => ResourceKind::Available,
            Resource::Present => ResourceKind::Present,
            Resource::HangingWith => ResourceKind::HangingWith,
            Resource::Request { .. } => ResourceKind::Request,
            Resource::Other(_) => ResourceKind::Other,
        }
    }

    fn parse(path: &str) -> Self {
        match path.split_once('/') {
            None => match path {
                "photo" => Resource::Photo,
                "avatar" => Resource::Avatar,
                "available" => Resource::Available,
                "present" => Resource::Present,
                "hanging_with" => Resource::HangingWith,
                other => Resource::Other(other.to_string()),
            },
            Some(("requests", target)) if !target.contains('/') => Resource::Request {
                target: target.to_string(),
            },
            Some(_) => Resource::Other(path.to_string()),
        }
    }

    fn encode(&self) -> String {
        match self {
            Resource::Photo => "photo".into(),
            Resource::Avatar => "avatar".into(),
            Resource::Available => "available".into(),
            Resource::Present => "present".into(),
            Resource::HangingWith => "hanging_with".into(),
            Resource::Request { target } => format!("requests/{target}"),
            Resource::Other(path) => path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Photo,
    Avatar,
    Available,
    Present,
    HangingWith,
    Request,
    Other,
}

/// A logical key split into owner and resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub owner: ParticipantId,
    pub resource: Resource,
}

impl ResourceKey {
    pub fn new(owner: ParticipantId, resource: Resource) -> Self {
        Self { owner, resource }
    }

    /// Parse a logical key. Keys without a resource segment are not part of
    /// the schema.
    pub fn parse(key: &str) -> Option<Self> {
        let (owner, path) = key.split_once('/')?;
        if owner.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            owner: ParticipantId::new(owner),
            resource: Resource::parse(path),
        })
    }

    /// The logical key string.
    pub fn encode(&self) -> String {
        format!("{}/{}", self.owner, self.resource.encode())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
