//! Resource snapshots
//!
//! A [`Resource`] is an immutable value. Every mutation produces a new value;
//! the cache swaps snapshots wholesale instead of patching fields in place.

use crate::core::acl::{Acl, Principal};
use crate::core::lock::{LockState, ResourceLock};
use crate::core::uri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Content metadata of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMeta {
    /// Content length in bytes
    pub length: u64,
    /// SHA-256 of the content, hex encoded (None until content is written)
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl ContentMeta {
    pub fn empty(now: DateTime<Utc>) -> Self {
        ContentMeta {
            length: 0,
            etag: None,
            last_modified: now,
        }
    }
}

/// What the cache must evict after a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Only the stored entry changes
    Entry,
    /// Inherited ACLs below the stored collection changed as well
    Subtree,
}

/// Snapshot of one repository resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    pub owner: Principal,
    pub is_collection: bool,
    /// Member uris (collections only)
    #[serde(default)]
    pub children: BTreeSet<String>,
    /// Resolved ACL (inherited ACLs are already a snapshot)
    pub acl: Acl,
    #[serde(default)]
    pub lock: Option<ResourceLock>,
    pub content: ContentMeta,
    pub created: DateTime<Utc>,
}

impl Resource {
    fn new(uri: impl Into<String>, owner: Principal, acl: Acl, is_collection: bool) -> Self {
        let now = Utc::now();
        Resource {
            uri: uri.into(),
            owner,
            is_collection,
            children: BTreeSet::new(),
            acl,
            lock: None,
            content: ContentMeta::empty(now),
            created: now,
        }
    }

    /// New empty collection
    pub fn collection(uri: impl Into<String>, owner: Principal, acl: Acl) -> Self {
        Self::new(uri, owner, acl, true)
    }

    /// New empty non-collection resource
    pub fn document(uri: impl Into<String>, owner: Principal, acl: Acl) -> Self {
        Self::new(uri, owner, acl, false)
    }

    /// The root collection with its default explicit ACL
    pub fn root(owner: Principal) -> Self {
        let acl = Acl::default_root(owner.clone());
        Self::collection(uri::ROOT, owner, acl)
    }

    pub fn is_root(&self) -> bool {
        self.uri == uri::ROOT
    }

    pub fn parent_uri(&self) -> Option<&str> {
        uri::parent(&self.uri)
    }

    /// Replace the ACL
    ///
    /// Returns the new snapshot and the invalidation it demands: a collection
    /// whose grant table changed invalidates its whole subtree, since every
    /// inheriting descendant must pick up a fresh snapshot.
    pub fn with_acl(&self, acl: Acl) -> (Resource, Invalidation) {
        let invalidation = if self.is_collection && !self.acl.same_entries(&acl) {
            Invalidation::Subtree
        } else {
            Invalidation::Entry
        };
        let resource = Resource {
            acl,
            ..self.clone()
        };
        (resource, invalidation)
    }

    pub fn with_lock(&self, lock: Option<ResourceLock>) -> Resource {
        Resource {
            lock,
            ..self.clone()
        }
    }

    pub fn with_content(&self, content: ContentMeta) -> Resource {
        Resource {
            content,
            ..self.clone()
        }
    }

    pub fn with_children(&self, children: BTreeSet<String>) -> Resource {
        Resource {
            children,
            ..self.clone()
        }
    }

    /// The lock if present and not expired at `now`
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<&ResourceLock> {
        match LockState::of(self.lock.as_ref(), now) {
            LockState::Locked(lock) => Some(lock),
            LockState::Unlocked => None,
        }
    }

    /// True if the snapshot carries a lock that has run out
    pub fn has_expired_lock(&self, now: DateTime<Utc>) -> bool {
        self.lock.as_ref().map_or(false, |lock| lock.is_expired(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::acl::Privilege;
    use crate::core::lock::LockDepth;

    fn alice() -> Principal {
        Principal::user("alice")
    }

    #[test]
    fn test_root() {
        let root = Resource::root(alice());
        assert!(root.is_root());
        assert!(root.is_collection);
        assert!(!root.acl.inherited);
        assert_eq!(root.parent_uri(), None);
    }

    #[test]
    fn test_with_acl_invalidation() {
        let root = Resource::root(alice());

        let (same, invalidation) = root.with_acl(root.acl.clone());
        assert_eq!(invalidation, Invalidation::Entry);
        assert_eq!(same, root);

        let changed = root.acl.clone().grant(Privilege::Read, Principal::All);
        let (updated, invalidation) = root.with_acl(changed);
        assert_eq!(invalidation, Invalidation::Subtree);
        assert!(updated.acl.contains(Privilege::Read, &Principal::All));
        // Original snapshot untouched
        assert!(!root.acl.contains(Privilege::Read, &Principal::All));

        let doc = Resource::document("/doc", alice(), Acl::default_root(alice()));
        let changed = doc.acl.clone().grant(Privilege::Read, Principal::All);
        assert_eq!(doc.with_acl(changed).1, Invalidation::Entry);
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let doc = Resource::document("/doc", alice(), Acl::default_root(alice())).with_lock(Some(
            ResourceLock {
                token: "opaquelocktoken:1".to_string(),
                owner: alice(),
                owner_info: String::new(),
                depth: LockDepth::Zero,
                timeout: now + chrono::Duration::seconds(5),
            },
        ));

        assert!(doc.active_lock(now).is_some());
        assert!(!doc.has_expired_lock(now));

        let later = now + chrono::Duration::seconds(10);
        assert!(doc.active_lock(later).is_none());
        assert!(doc.has_expired_lock(later));
    }
}
