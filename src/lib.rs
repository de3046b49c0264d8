//! # davrepo - Hierarchical Content Repository Core
//!
//! `davrepo` is the engine behind a WebDAV-style content repository: the part
//! that decides who may do what, serialises conflicting writers, and keeps a
//! shared in-memory cache consistent with a slow backing store.
//!
//! - **ACL authorization** with snapshot inheritance, pseudo-principals and
//!   injected administrative roles
//! - **Resource locks**: exclusive write locks with tokens and lazy expiry
//! - **Key lock table**: per-key mutual exclusion, deadlock-free for key sets
//! - **Resource cache**: bounded, stampede-proof and invalidation-consistent
//! - **Repository**: the operations (retrieve, create, copy, move, delete,
//!   lock, unlock, store ACL, store content) composed from the above
//!
//! ## Quick Start
//!
//! ```rust
//! use davrepo::{MemoryStore, Principal, Privilege, RepositoryBuilder, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let alice = Principal::user("alice");
//! let repo = RepositoryBuilder::new()
//!     .store(Arc::new(MemoryStore::new(alice.clone())))
//!     .build()?;
//!
//! repo.create_collection(Some(&alice), "/projects", None)?;
//! repo.create_document(Some(&alice), "/projects/plan.txt", None)?;
//!
//! let listing = repo.list_children(Some(&alice), "/projects")?;
//! assert_eq!(listing.len(), 1);
//!
//! // Nobody else was granted anything
//! let bob = Principal::user("bob");
//! assert!(repo.retrieve(Some(&bob), "/projects/plan.txt").is_err());
//!
//! let acl = repo.get_acl(Some(&alice), "/projects")?;
//! repo.store_acl(Some(&alice), "/projects", acl.explicit().grant(Privilege::Read, bob.clone()))?;
//! assert!(repo.retrieve(Some(&bob), "/projects/plan.txt").is_ok());
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use davrepo::{MemoryStore, Principal, RepositoryBuilder, RepositoryConfig, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let config = RepositoryConfig::from_file("davrepo.toml")?;
//! let repo = RepositoryBuilder::new()
//!     .config(config)
//!     .store(Arc::new(MemoryStore::new(Principal::user("admin"))))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    acl::{
        validate_acl, Acl, AuthorizationEngine, Decision, Principal, PrincipalDirectory,
        Privilege, Role, RoleConfig, StaticDirectory,
    },
    cache::{CacheStats, CacheTxn, KeyPlan, ResourceCache},
    config::{CacheConfig, EvictionPolicy, KeyLockConfig, LockConfig, RepositoryConfig},
    error::{RepositoryError, Result},
    keylock::{KeyGuard, KeyLockTable},
    lock::{LockDepth, LockState, ResourceLock},
    repository::{LockRequest, Repository},
    resource::{ContentMeta, Invalidation, Resource},
    store::{BackingStore, ChangeKind, ChangeLogEntry, MemoryStore, StoreError, StoreResult},
};

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for assembling a [`Repository`]
///
/// Provides a fluent API over configuration, backing store and principal
/// directory.
///
/// # Examples
///
/// ```rust
/// use davrepo::{MemoryStore, Principal, RepositoryBuilder, RoleConfig, StaticDirectory};
/// use std::sync::Arc;
///
/// # fn main() -> davrepo::Result<()> {
/// let directory = StaticDirectory::new().add_member("staff", Principal::user("bob"));
/// let repo = RepositoryBuilder::new()
///     .store(Arc::new(MemoryStore::new(Principal::user("alice"))))
///     .roles(RoleConfig::default().with_root("admin"))
///     .directory(Arc::new(directory))
///     .read_only(false)
///     .build()?;
/// assert!(!repo.is_read_only());
/// # Ok(())
/// # }
/// ```
pub struct RepositoryBuilder<S: BackingStore> {
    config: RepositoryConfig,
    store: Option<Arc<S>>,
    directory: Option<Arc<dyn PrincipalDirectory>>,
}

impl<S: BackingStore> RepositoryBuilder<S> {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        RepositoryBuilder {
            config: RepositoryConfig::default(),
            store: None,
            directory: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML file
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.config = RepositoryConfig::from_file(path)?;
        Ok(self)
    }

    /// Set the backing store (required)
    pub fn store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the group membership directory (defaults to no groups)
    pub fn directory(mut self, directory: Arc<dyn PrincipalDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Set the administrative role assignment
    pub fn roles(mut self, roles: RoleConfig) -> Self {
        self.config.roles = roles;
        self
    }

    /// Start in maintenance mode
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Build the repository
    pub fn build(self) -> Result<Repository<S>> {
        let store = self
            .store
            .ok_or_else(|| RepositoryError::Config("backing store must be set".to_string()))?;

        let directory = self.directory.unwrap_or_else(|| {
            debug!("No principal directory configured, group grants never match");
            Arc::new(StaticDirectory::new())
        });

        info!(
            "Building repository (cache {} items, {:?} eviction, read-only {})",
            self.config.cache.max_items, self.config.cache.policy, self.config.read_only
        );
        Repository::new(store, &self.config, directory)
    }
}

impl<S: BackingStore> Default for RepositoryBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
