//! Keyed mutation scope over the resource cache

use super::ResourceCache;
use crate::core::acl::{Acl, Principal};
use crate::core::error::{RepositoryError, Result};
use crate::core::keylock::KeyGuard;
use crate::core::resource::{Invalidation, Resource};
use crate::core::store::{inheriting_descendants, BackingStore, ChangeLogEntry};
use crate::core::uri;
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

/// A set of held key locks plus the cache operations allowed under them
///
/// Loads of held keys may populate the cache; loads of other keys read
/// through without caching, so a transaction never waits on a key it does not
/// hold. Dropping the transaction releases every key.
pub struct CacheTxn<'a, S: BackingStore> {
    cache: &'a ResourceCache<S>,
    guard: KeyGuard<'a>,
}

impl<'a, S: BackingStore> CacheTxn<'a, S> {
    pub(super) fn new(cache: &'a ResourceCache<S>, guard: KeyGuard<'a>) -> Self {
        CacheTxn { cache, guard }
    }

    /// Held keys, sorted
    pub fn keys(&self) -> &[String] {
        self.guard.keys()
    }

    pub fn holds(&self, uri: &str) -> bool {
        self.guard.holds(uri)
    }

    fn require(&self, uri: &str) -> Result<()> {
        if self.holds(uri) {
            Ok(())
        } else {
            Err(RepositoryError::IllegalOperation(format!(
                "{} is not held by this transaction",
                uri
            )))
        }
    }

    pub fn load(&self, uri: &str) -> Result<Arc<Resource>> {
        if self.holds(uri) {
            self.cache.load_held(uri)
        } else {
            self.cache.load_through(uri)
        }
    }

    /// Like [`load`](Self::load), mapping absence to `None`
    pub fn try_load(&self, uri: &str) -> Result<Option<Arc<Resource>>> {
        match self.load(uri) {
            Ok(resource) => Ok(Some(resource)),
            Err(RepositoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist `resource` and refresh the cache
    ///
    /// With [`Invalidation::Subtree`] the inherited ACL snapshots below the
    /// resource are rewritten in the backing store and every cached
    /// descendant is evicted. If the backing store fails, the cache is left
    /// as it was.
    pub fn store(&self, resource: Resource, invalidation: Invalidation) -> Result<Arc<Resource>> {
        self.require(&resource.uri)?;
        self.cache.store.store(&resource)?;

        let stored = Arc::new(resource);
        match invalidation {
            Invalidation::Entry => {
                self.cache.replace(&stored.uri, Arc::clone(&stored));
            }
            Invalidation::Subtree => {
                let propagated = self.propagate_acl(&stored);
                let evicted = self.cache.evict_subtree(&stored.uri);
                debug!("Evicted {} cached entries below {}", evicted, stored.uri);
                propagated?;
                self.cache.replace(&stored.uri, Arc::clone(&stored));
            }
        }
        Ok(stored)
    }

    /// Rewrite the ACL snapshot of every descendant inheriting from `root`
    fn propagate_acl(&self, root: &Resource) -> Result<()> {
        let descendants = inheriting_descendants(self.cache.store.as_ref(), &root.uri)?;
        for descendant in &descendants {
            self.require(&descendant.uri)?;
            let acl = Acl::inherit_from(&root.acl, descendant.owner.clone());
            let (updated, _) = descendant.with_acl(acl);
            self.cache.store.store(&updated)?;
        }
        debug!(
            "Propagated ACL of {} to {} descendants",
            root.uri,
            descendants.len()
        );
        Ok(())
    }

    /// Delete `resource` with its subtree and evict everything cached below it
    pub fn delete(&self, resource: &Resource) -> Result<()> {
        self.require(&resource.uri)?;
        self.cache.store.delete(resource)?;

        self.cache.evict_subtree(&resource.uri);
        if let Some(parent) = resource.parent_uri() {
            self.cache.evict(parent);
        }
        Ok(())
    }

    /// Copy `resource` with its subtree to `dest`, replacing whatever is there
    ///
    /// The replacement happens in one backing-store step, so a failure leaves
    /// both the destination and the cache untouched.
    pub fn copy(
        &self,
        resource: &Resource,
        dest: &str,
        copy_acl: bool,
        owner: &Principal,
    ) -> Result<()> {
        self.require(dest)?;
        self.cache.store.copy(resource, dest, copy_acl, owner)?;

        self.cache.evict_subtree(dest);
        if let Some(parent) = uri::parent(dest) {
            self.cache.evict(parent);
        }
        Ok(())
    }

    /// Move `resource` with its subtree to `dest`, replacing whatever is there
    pub fn move_to(&self, resource: &Resource, dest: &str) -> Result<()> {
        self.require(&resource.uri)?;
        self.require(dest)?;
        self.cache.store.move_to(resource, dest)?;

        self.cache.evict_subtree(&resource.uri);
        self.cache.evict_subtree(dest);
        for parent in [resource.parent_uri(), uri::parent(dest)].into_iter().flatten() {
            self.cache.evict(parent);
        }
        Ok(())
    }

    /// Replace the content of `resource`, persisting bytes and metadata together
    pub fn write_content(
        &self,
        resource: &Resource,
        content: &mut dyn Read,
    ) -> Result<Arc<Resource>> {
        self.require(&resource.uri)?;
        let meta = self.cache.store.write_content(resource, content)?;

        let updated = Arc::new(resource.with_content(meta));
        self.cache.replace(&updated.uri, Arc::clone(&updated));
        Ok(updated)
    }

    /// Drop one cached entry
    pub fn evict(&self, uri: &str) {
        self.cache.evict(uri);
    }

    /// Append a change-log record to the backing store
    pub fn log(&self, entry: ChangeLogEntry) -> Result<()> {
        self.cache.store.add_change_log_entry(entry)?;
        Ok(())
    }

    /// Direct access to the backing store (content streams, discovery)
    pub fn backing(&self) -> &S {
        self.cache.store.as_ref()
    }
}
