//! Backing store contract
//!
//! The repository core treats persistence as an external collaborator reached
//! through [`BackingStore`]. Its latency is opaque; the cache in front of it
//! is the only thing that makes repeated reads cheap.
//!
//! [`MemoryStore`] is a complete in-memory implementation.

mod memory;

pub use memory::MemoryStore;

use crate::core::acl::Principal;
use crate::core::resource::{ContentMeta, Resource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use thiserror::Error;

/// Backing store failures, surfaced to callers verbatim
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing resource in store: {0}")]
    Missing(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Kind of a recorded mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Copy,
    Move,
    Lock,
    Unlock,
    AclUpdate,
}

/// One change-log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub kind: ChangeKind,
    pub uri: String,
    /// Destination of copy and move
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Acting principal, `None` for unauthenticated callers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    pub at: DateTime<Utc>,
}

impl ChangeLogEntry {
    pub fn new(kind: ChangeKind, uri: impl Into<String>, principal: Option<&Principal>) -> Self {
        ChangeLogEntry {
            kind,
            uri: uri.into(),
            destination: None,
            principal: principal.map(|p| p.to_string()),
            at: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Persistence interface consumed by the cache and the repository
///
/// Resource membership is owned by the store: storing a new resource links it
/// into its parent's child list, deleting unlinks it, and the `children` of
/// an incoming snapshot are never trusted.
pub trait BackingStore: Send + Sync {
    /// Load one resource, `None` if absent
    fn load(&self, uri: &str) -> StoreResult<Option<Resource>>;

    /// Load the direct members of a collection
    fn load_children(&self, uri: &str) -> StoreResult<Vec<Resource>>;

    /// Insert or replace a resource; the parent must exist
    fn store(&self, resource: &Resource) -> StoreResult<()>;

    /// Delete a resource with its whole subtree and content
    fn delete(&self, resource: &Resource) -> StoreResult<()>;

    /// Copy a resource with its whole subtree to `dest`
    ///
    /// With `copy_acl` the copies keep their owners and explicit ACLs, and
    /// inherited ACLs are re-snapshotted from their new ancestors. Without it,
    /// every copy is owned by `owner` and inherits from the destination parent.
    /// Locks are never copied. An existing `dest` subtree is replaced in the
    /// same step; on failure it is left untouched.
    fn copy(&self, resource: &Resource, dest: &str, copy_acl: bool, owner: &Principal)
        -> StoreResult<()>;

    /// Relocate a resource with its whole subtree to `dest` in one step
    ///
    /// Owners and explicit ACLs travel, inherited ACLs are re-snapshotted
    /// under the new parent and locks are dropped. An existing `dest` subtree
    /// is replaced. On failure both source and destination are left untouched.
    fn move_to(&self, resource: &Resource, dest: &str) -> StoreResult<()>;

    /// Uris in the subtree of `uri` (inclusive) carrying an explicit ACL
    fn discover_acls(&self, uri: &str) -> StoreResult<Vec<String>>;

    /// Uris in the subtree of `uri` (inclusive) carrying a lock, expired or not
    fn discover_locks(&self, uri: &str) -> StoreResult<Vec<String>>;

    /// Stream the content of a resource
    fn read_content(&self, resource: &Resource) -> StoreResult<Box<dyn Read + Send>>;

    /// Replace the content of a resource, returning its new metadata
    ///
    /// Bytes and metadata are persisted together. Fails with
    /// [`StoreError::Missing`] if the resource is gone by the time the stream
    /// has been consumed, leaving no content behind.
    fn write_content(&self, resource: &Resource, content: &mut dyn Read)
        -> StoreResult<ContentMeta>;

    /// Append a change-log record
    fn add_change_log_entry(&self, entry: ChangeLogEntry) -> StoreResult<()>;
}

/// Inheriting descendants of `uri`, parents before children
///
/// The walk stops at explicit ACLs: below those, nothing inherits from `uri`.
pub fn inheriting_descendants<S: BackingStore + ?Sized>(
    store: &S,
    uri: &str,
) -> StoreResult<Vec<Resource>> {
    let mut found = Vec::new();
    let mut pending = vec![uri.to_string()];

    while let Some(current) = pending.pop() {
        for child in store.load_children(&current)? {
            if !child.acl.inherited {
                continue;
            }
            if child.is_collection {
                pending.push(child.uri.clone());
            }
            found.push(child);
        }
    }

    Ok(found)
}
