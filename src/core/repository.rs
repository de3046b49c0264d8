//! Repository orchestrator
//!
//! Composes authorization, resource locks and the cache into the operations a
//! protocol layer calls. Every mutating operation follows one protocol inside
//! a single [`CacheTxn`]:
//!
//! 1. load the resources it touches
//! 2. check every privilege it needs, on every resource it touches
//! 3. check resource locks on everything it mutates
//! 4. mutate the backing store
//! 5. invalidate the cache
//!
//! Steps 1-3 never mutate. If step 4 fails, the cache keeps its previous state.

use crate::core::acl::{
    validate_acl, Acl, AuthorizationEngine, Principal, PrincipalDirectory, Privilege, Role,
};
use crate::core::cache::{CacheTxn, KeyPlan, ResourceCache};
use crate::core::config::{LockConfig, RepositoryConfig};
use crate::core::error::{RepositoryError, Result};
use crate::core::lock::{self, LockDepth, LockState, ResourceLock};
use crate::core::resource::{Invalidation, Resource};
use crate::core::store::{BackingStore, ChangeKind, ChangeLogEntry};
use crate::core::uri;
use chrono::Utc;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Parameters of a LOCK request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub depth: LockDepth,
    /// Free-form owner information
    pub owner_info: String,
    /// Requested timeout; `None` uses the configured default
    pub timeout: Option<Duration>,
    /// Token of the lock to refresh instead of acquiring a new one
    pub refresh_token: Option<String>,
}

impl LockRequest {
    pub fn new(depth: LockDepth) -> Self {
        LockRequest {
            depth,
            owner_info: String::new(),
            timeout: None,
            refresh_token: None,
        }
    }

    pub fn with_owner_info(mut self, info: impl Into<String>) -> Self {
        self.owner_info = info.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn refreshing(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }
}

/// Log and pass through a failed backing-store mutation
fn mutation<T>(operation: &str, uri: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        warn!("{} of {} failed: {}", operation, uri, e);
    }
    result
}

/// The repository core
pub struct Repository<S: BackingStore> {
    cache: ResourceCache<S>,
    engine: AuthorizationEngine,
    locks: LockConfig,
    read_only: AtomicBool,
}

impl<S: BackingStore> Repository<S> {
    /// Assemble a repository over `store`
    ///
    /// Role assignments come from `config.roles`; group membership is
    /// resolved through `directory`.
    pub fn new(
        store: Arc<S>,
        config: &RepositoryConfig,
        directory: Arc<dyn PrincipalDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Repository {
            cache: ResourceCache::new(store, &config.cache, &config.key_locks),
            engine: AuthorizationEngine::new(config.roles.clone(), directory),
            locks: config.locks.clone(),
            read_only: AtomicBool::new(config.read_only),
        })
    }

    pub fn cache(&self) -> &ResourceCache<S> {
        &self.cache
    }

    pub fn engine(&self) -> &AuthorizationEngine {
        &self.engine
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Toggle maintenance mode; Root callers keep write access
    pub fn set_read_only(&self, read_only: bool) {
        info!("Repository read-only mode set to {}", read_only);
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn is_root(&self, principal: Option<&Principal>) -> bool {
        self.engine.has_role(principal, Role::Root)
    }

    fn ensure_writable(&self, principal: Option<&Principal>) -> Result<()> {
        if self.is_read_only() && !self.is_root(principal) {
            return Err(RepositoryError::ReadOnly);
        }
        Ok(())
    }

    fn check(
        &self,
        resource: &Resource,
        principal: Option<&Principal>,
        privilege: Privilege,
    ) -> Result<()> {
        self.engine.check(
            &resource.uri,
            &resource.acl,
            &resource.owner,
            principal,
            privilege,
        )
    }

    fn lock_bypass(&self, principal: Option<&Principal>) -> bool {
        self.locks.root_bypasses_locks && self.is_root(principal)
    }

    fn check_lock(&self, resource: &Resource, principal: Option<&Principal>) -> Result<()> {
        lock::lock_authorize(
            resource,
            principal,
            Privilege::Write,
            self.lock_bypass(principal),
            Utc::now(),
        )
    }

    /// Check `privilege` on `root` and on every explicit ACL below it
    fn check_subtree(
        &self,
        txn: &CacheTxn<'_, S>,
        root: &Resource,
        principal: Option<&Principal>,
        privilege: Privilege,
    ) -> Result<()> {
        self.check(root, principal, privilege)?;
        if !root.is_collection {
            return Ok(());
        }
        for uri in txn.backing().discover_acls(&root.uri)? {
            if let Some(node) = txn.try_load(&uri)? {
                self.check(&node, principal, privilege)?;
            }
        }
        Ok(())
    }

    /// Refuse when a foreign active lock exists anywhere in the subtree
    fn check_subtree_locks(
        &self,
        txn: &CacheTxn<'_, S>,
        root: &Resource,
        principal: Option<&Principal>,
    ) -> Result<()> {
        self.check_lock(root, principal)?;
        if !root.is_collection {
            return Ok(());
        }
        for uri in txn.backing().discover_locks(&root.uri)? {
            if let Some(node) = txn.try_load(&uri)? {
                self.check_lock(&node, principal)?;
            }
        }
        Ok(())
    }

    fn acting_user<'p>(
        &self,
        uri: &str,
        principal: Option<&'p Principal>,
        privilege: Privilege,
    ) -> Result<&'p Principal> {
        match principal {
            Some(p @ Principal::User(_)) => Ok(p),
            Some(other) => Err(RepositoryError::IllegalOperation(format!(
                "'{}' cannot act as a user",
                other
            ))),
            None => Err(RepositoryError::AuthenticationRequired {
                uri: uri.to_string(),
                privilege,
            }),
        }
    }

    fn log(
        &self,
        txn: &CacheTxn<'_, S>,
        kind: ChangeKind,
        uri: &str,
        destination: Option<&str>,
        principal: Option<&Principal>,
    ) -> Result<()> {
        let entry = ChangeLogEntry::new(kind, uri, principal);
        let entry = match destination {
            Some(dest) => entry.with_destination(dest),
            None => entry,
        };
        txn.log(entry)
    }

    fn retrieve_with(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        privilege: Privilege,
    ) -> Result<Arc<Resource>> {
        let uri = uri::normalize(uri)?;
        let resource = self.cache.load(&uri)?;
        self.check(&resource, principal, privilege)?;
        Ok(resource)
    }

    /// Load a resource the caller may read
    pub fn retrieve(&self, principal: Option<&Principal>, uri: &str) -> Result<Arc<Resource>> {
        self.retrieve_with(principal, uri, Privilege::Read)
    }

    /// Load a resource for a processed rendition
    pub fn retrieve_processed(
        &self,
        principal: Option<&Principal>,
        uri: &str,
    ) -> Result<Arc<Resource>> {
        self.retrieve_with(principal, uri, Privilege::ReadProcessed)
    }

    /// Members of a collection the caller may read
    pub fn list_children(
        &self,
        principal: Option<&Principal>,
        uri: &str,
    ) -> Result<Vec<Arc<Resource>>> {
        let parent = self.retrieve(principal, uri)?;
        if !parent.is_collection {
            return Err(RepositoryError::IllegalOperation(format!(
                "{} is not a collection",
                parent.uri
            )));
        }

        Ok(self
            .cache
            .load_children(&parent.uri)?
            .into_iter()
            .filter(|child| {
                self.engine
                    .authorize(&child.acl, &child.owner, principal, Privilege::Read)
                    .is_granted()
            })
            .collect())
    }

    /// Stream the content of a document
    pub fn read_content(
        &self,
        principal: Option<&Principal>,
        uri: &str,
    ) -> Result<Box<dyn Read + Send>> {
        let resource = self.retrieve(principal, uri)?;
        if resource.is_collection {
            return Err(RepositoryError::IllegalOperation(format!(
                "{} is a collection",
                resource.uri
            )));
        }
        Ok(self.cache.backing().read_content(&resource)?)
    }

    pub fn get_acl(&self, principal: Option<&Principal>, uri: &str) -> Result<Acl> {
        let resource = self.retrieve_with(principal, uri, Privilege::ReadAcl)?;
        Ok(resource.acl.clone())
    }

    /// Create an empty collection
    ///
    /// Without `acl` the collection inherits from its parent. An explicit ACL
    /// is validated with the caller as owner.
    pub fn create_collection(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        acl: Option<Acl>,
    ) -> Result<Arc<Resource>> {
        self.create(principal, uri, true, acl)
    }

    /// Create an empty document
    pub fn create_document(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        acl: Option<Acl>,
    ) -> Result<Arc<Resource>> {
        self.create(principal, uri, false, acl)
    }

    fn create(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        is_collection: bool,
        acl: Option<Acl>,
    ) -> Result<Arc<Resource>> {
        let uri = uri::normalize(uri)?;
        let parent_uri = uri::parent(&uri)
            .ok_or_else(|| RepositoryError::AlreadyExists(uri.clone()))?
            .to_string();
        self.ensure_writable(principal)?;

        let txn = self
            .cache
            .begin(KeyPlan::new().key(&uri).key(&parent_uri))?;

        let parent = txn
            .try_load(&parent_uri)?
            .ok_or_else(|| RepositoryError::NotFound(parent_uri.clone()))?;
        if !parent.is_collection {
            return Err(RepositoryError::IllegalOperation(format!(
                "{} is not a collection",
                parent_uri
            )));
        }
        self.check(&parent, principal, Privilege::Bind)?;
        let owner = self.acting_user(&uri, principal, Privilege::Bind)?;
        self.check_lock(&parent, principal)?;

        if txn.try_load(&uri)?.is_some() {
            return Err(RepositoryError::AlreadyExists(uri));
        }

        let acl = match acl {
            Some(acl) => {
                let acl = Acl {
                    owner: owner.clone(),
                    ..acl
                }
                .explicit();
                validate_acl(&acl)?;
                acl
            }
            None => Acl::inherit_from(&parent.acl, owner.clone()),
        };

        let resource = if is_collection {
            Resource::collection(&uri, owner.clone(), acl)
        } else {
            Resource::document(&uri, owner.clone(), acl)
        };

        let stored = mutation("create", &uri, txn.store(resource, Invalidation::Entry))?;
        txn.evict(&parent_uri);
        self.log(&txn, ChangeKind::Create, &uri, None, principal)?;

        info!("Created {} ({})", uri, if is_collection { "collection" } else { "document" });
        Ok(stored)
    }

    /// Replace the content of a document
    pub fn store_content(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        content: &mut dyn Read,
    ) -> Result<Arc<Resource>> {
        let uri = uri::normalize(uri)?;
        self.ensure_writable(principal)?;

        let txn = self.cache.lock(&uri)?;
        let resource = txn.load(&uri)?;
        self.check(&resource, principal, Privilege::Write)?;
        self.check_lock(&resource, principal)?;
        if resource.is_collection {
            return Err(RepositoryError::IllegalOperation(format!(
                "{} is a collection",
                uri
            )));
        }

        let stored = mutation("store_content", &uri, txn.write_content(&resource, content))?;
        self.log(&txn, ChangeKind::Update, &uri, None, principal)?;

        info!("Stored {} bytes at {}", stored.content.length, uri);
        Ok(stored)
    }

    /// Delete a resource and its whole subtree
    pub fn delete(&self, principal: Option<&Principal>, uri: &str) -> Result<()> {
        let uri = uri::normalize(uri)?;
        let parent_uri = uri::parent(&uri)
            .ok_or_else(|| RepositoryError::IllegalOperation("cannot delete the root".to_string()))?
            .to_string();
        self.ensure_writable(principal)?;

        let txn = self
            .cache
            .begin(KeyPlan::new().subtree(&uri).key(&parent_uri))?;

        let resource = txn.load(&uri)?;
        let parent = txn.load(&parent_uri)?;

        self.check(&parent, principal, Privilege::Unbind)?;
        self.check_subtree(&txn, &resource, principal, Privilege::Write)?;
        self.check_lock(&parent, principal)?;
        self.check_subtree_locks(&txn, &resource, principal)?;

        mutation("delete", &uri, txn.delete(&resource))?;
        self.log(&txn, ChangeKind::Delete, &uri, None, principal)?;

        info!("Deleted {}", uri);
        Ok(())
    }

    /// Reject copy/move targets that cannot work
    fn check_destination(&self, source: &str, dest: &str) -> Result<String> {
        if dest == uri::ROOT {
            return Err(RepositoryError::IllegalOperation(
                "cannot overwrite the root".to_string(),
            ));
        }
        if uri::is_same_or_descendant(dest, source) {
            return Err(RepositoryError::IllegalOperation(format!(
                "cannot copy {} into itself ({})",
                source, dest
            )));
        }
        Ok(uri::parent(dest).unwrap_or(uri::ROOT).to_string())
    }

    /// Copy-side checks on the destination parent and any existing destination
    fn prepare_destination(
        &self,
        txn: &CacheTxn<'_, S>,
        dest: &str,
        dest_parent: &str,
        overwrite: bool,
        principal: Option<&Principal>,
    ) -> Result<()> {
        let parent = txn
            .try_load(dest_parent)?
            .ok_or_else(|| RepositoryError::NotFound(dest_parent.to_string()))?;
        if !parent.is_collection {
            return Err(RepositoryError::IllegalOperation(format!(
                "{} is not a collection",
                dest_parent
            )));
        }
        self.check(&parent, principal, Privilege::Bind)?;
        self.check_lock(&parent, principal)?;

        if let Some(existing) = txn.try_load(dest)? {
            if !overwrite {
                return Err(RepositoryError::AlreadyExists(dest.to_string()));
            }
            self.check_subtree(txn, &existing, principal, Privilege::Write)?;
            self.check_subtree_locks(txn, &existing, principal)?;
        }
        Ok(())
    }

    /// Copy a resource and its subtree to `dest`
    ///
    /// The copies belong to the caller and inherit from their new parent.
    /// With `overwrite`, an existing destination is replaced in the same
    /// backing-store step; without it an existing destination is an error.
    pub fn copy(
        &self,
        principal: Option<&Principal>,
        source: &str,
        dest: &str,
        overwrite: bool,
    ) -> Result<Arc<Resource>> {
        let source = uri::normalize(source)?;
        let dest = uri::normalize(dest)?;
        let dest_parent = self.check_destination(&source, &dest)?;
        self.ensure_writable(principal)?;

        let txn = self.cache.begin(
            KeyPlan::new()
                .key(&source)
                .subtree(&dest)
                .key(&dest_parent),
        )?;

        let resource = txn.load(&source)?;
        self.check_subtree(&txn, &resource, principal, Privilege::Read)?;
        self.prepare_destination(&txn, &dest, &dest_parent, overwrite, principal)?;
        let owner = self.acting_user(&dest, principal, Privilege::Bind)?;

        mutation("copy", &source, txn.copy(&resource, &dest, false, owner))?;
        self.log(&txn, ChangeKind::Copy, &source, Some(&dest), principal)?;

        info!("Copied {} to {}", source, dest);
        txn.load(&dest)
    }

    /// Move a resource and its subtree to `dest`
    ///
    /// Owners and explicit ACLs travel with the resources; inherited ACLs are
    /// re-snapshotted under the new parent. Locks do not survive a move. The
    /// backing store relocates the subtree in one step, so a failed move
    /// leaves source and destination as they were.
    pub fn move_to(
        &self,
        principal: Option<&Principal>,
        source: &str,
        dest: &str,
        overwrite: bool,
    ) -> Result<Arc<Resource>> {
        let source = uri::normalize(source)?;
        let dest = uri::normalize(dest)?;
        let source_parent = uri::parent(&source)
            .ok_or_else(|| RepositoryError::IllegalOperation("cannot move the root".to_string()))?
            .to_string();
        let dest_parent = self.check_destination(&source, &dest)?;
        self.ensure_writable(principal)?;

        let txn = self.cache.begin(
            KeyPlan::new()
                .subtree(&source)
                .key(&source_parent)
                .subtree(&dest)
                .key(&dest_parent),
        )?;

        let resource = txn.load(&source)?;
        let parent = txn.load(&source_parent)?;

        self.check(&parent, principal, Privilege::Unbind)?;
        self.check_subtree(&txn, &resource, principal, Privilege::Write)?;
        self.check_subtree(&txn, &resource, principal, Privilege::Read)?;
        self.check_lock(&parent, principal)?;
        self.check_subtree_locks(&txn, &resource, principal)?;
        self.prepare_destination(&txn, &dest, &dest_parent, overwrite, principal)?;

        mutation("move", &source, txn.move_to(&resource, &dest))?;
        self.log(&txn, ChangeKind::Move, &source, Some(&dest), principal)?;

        info!("Moved {} to {}", source, dest);
        txn.load(&dest)
    }

    /// Acquire or refresh an exclusive write lock
    pub fn lock(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        request: LockRequest,
    ) -> Result<ResourceLock> {
        let uri = uri::normalize(uri)?;
        self.ensure_writable(principal)?;

        let txn = self.cache.lock(&uri)?;
        let resource = txn.load(&uri)?;
        self.check(&resource, principal, Privilege::Write)?;
        let holder = self.acting_user(&uri, principal, Privilege::Write)?;

        let now = Utc::now();
        let ttl = self.locks.effective_timeout(request.timeout);
        let state = LockState::of(resource.lock.as_ref(), now);

        let granted = match &request.refresh_token {
            Some(token) => lock::refresh(&uri, state, holder, token, ttl, now)?,
            None => {
                if request.depth == LockDepth::Infinity {
                    self.check_subtree_locks(&txn, &resource, principal)?;
                }
                lock::acquire(&uri, state, holder, &request.owner_info, request.depth, ttl, now)?
            }
        };

        mutation(
            "lock",
            &uri,
            txn.store(resource.with_lock(Some(granted.clone())), Invalidation::Entry),
        )?;
        self.log(&txn, ChangeKind::Lock, &uri, None, principal)?;

        info!("Locked {} (depth {}) until {}", uri, granted.depth, granted.timeout);
        Ok(granted)
    }

    /// Release a lock; allowed for the lock owner or Root
    pub fn unlock(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        token: Option<&str>,
    ) -> Result<()> {
        let uri = uri::normalize(uri)?;
        self.ensure_writable(principal)?;
        let caller = self.acting_user(&uri, principal, Privilege::Unlock)?;

        let txn = self.cache.lock(&uri)?;
        let resource = txn.load(&uri)?;
        let state = LockState::of(resource.lock.as_ref(), Utc::now());
        lock::release(&uri, state, caller, token, self.is_root(principal))?;

        mutation(
            "unlock",
            &uri,
            txn.store(resource.with_lock(None), Invalidation::Entry),
        )?;
        self.log(&txn, ChangeKind::Unlock, &uri, None, principal)?;

        info!("Unlocked {}", uri);
        Ok(())
    }

    /// Replace the ACL of a resource
    ///
    /// The owner is kept. An ACL marked inherited resets the resource to a
    /// snapshot of its parent. A changed grant table on a collection is pushed
    /// to every inheriting descendant.
    pub fn store_acl(
        &self,
        principal: Option<&Principal>,
        uri: &str,
        acl: Acl,
    ) -> Result<Arc<Resource>> {
        let uri = uri::normalize(uri)?;
        self.ensure_writable(principal)?;

        let txn = self.cache.begin(KeyPlan::new().inheriting(&uri))?;
        let resource = txn.load(&uri)?;
        self.check(&resource, principal, Privilege::WriteAcl)?;
        self.check_lock(&resource, principal)?;

        let acl = if acl.inherited {
            let parent_uri = resource.parent_uri().ok_or_else(|| {
                RepositoryError::IllegalAcl("the root ACL cannot be inherited".to_string())
            })?;
            let parent = txn.load(parent_uri)?;
            Acl::inherit_from(&parent.acl, resource.owner.clone())
        } else {
            Acl {
                owner: resource.owner.clone(),
                ..acl
            }
        };
        validate_acl(&acl)?;

        let (updated, invalidation) = resource.with_acl(acl);
        let stored = mutation("store_acl", &uri, txn.store(updated, invalidation))?;
        self.log(&txn, ChangeKind::AclUpdate, &uri, None, principal)?;

        info!("Stored ACL of {} ({:?} invalidation)", uri, invalidation);
        Ok(stored)
    }
}
