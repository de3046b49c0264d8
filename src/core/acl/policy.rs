//! ACL document structure
//!
//! An [`Acl`] maps each [`Privilege`] to the set of principals granted it. ACLs
//! are plain values: an inherited ACL is a snapshot copy of its nearest
//! explicit ancestor, never a reference to it.

use super::Principal;
use crate::core::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Privileges that can be granted on repository resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Privilege {
    /// Read resource content and properties
    Read,
    /// Read a processed rendition; also granted by `Read`
    ReadProcessed,
    /// Read the ACL itself
    ReadAcl,
    /// Modify content and properties
    Write,
    /// Replace the ACL
    WriteAcl,
    /// Add members to a collection
    Bind,
    /// Remove members from a collection
    Unbind,
    /// Remove locks
    Unlock,
}

impl Privilege {
    /// Every privilege, in declaration order
    pub const ALL: [Privilege; 8] = [
        Privilege::Read,
        Privilege::ReadProcessed,
        Privilege::ReadAcl,
        Privilege::Write,
        Privilege::WriteAcl,
        Privilege::Bind,
        Privilege::Unbind,
        Privilege::Unlock,
    ];

    /// Privileges the owner must always hold
    pub const OWNER_REQUIRED: [Privilege; 3] =
        [Privilege::Read, Privilege::Write, Privilege::WriteAcl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Read => "read",
            Privilege::ReadProcessed => "read-processed",
            Privilege::ReadAcl => "read-acl",
            Privilege::Write => "write",
            Privilege::WriteAcl => "write-acl",
            Privilege::Bind => "bind",
            Privilege::Unbind => "unbind",
            Privilege::Unlock => "unlock",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access control list of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// Owner of the resource this ACL belongs to
    pub owner: Principal,

    /// True if the entries are a snapshot of the nearest explicit ancestor
    #[serde(default)]
    pub inherited: bool,

    /// Privilege to granted principals
    #[serde(default)]
    pub entries: BTreeMap<Privilege, BTreeSet<Principal>>,
}

impl Acl {
    /// Create an explicit ACL with no grants
    pub fn new(owner: Principal) -> Self {
        Acl {
            owner,
            inherited: false,
            entries: BTreeMap::new(),
        }
    }

    /// The ACL installed on a freshly bootstrapped root collection
    ///
    /// The owner pseudo-principal holds every privilege.
    pub fn default_root(owner: Principal) -> Self {
        Privilege::ALL
            .iter()
            .fold(Acl::new(owner), |acl, p| acl.grant(*p, Principal::Owner))
    }

    /// Snapshot copy of `ancestor` for a resource owned by `owner`
    pub fn inherit_from(ancestor: &Acl, owner: Principal) -> Self {
        Acl {
            owner,
            inherited: true,
            entries: ancestor.entries.clone(),
        }
    }

    /// Same entries, marked explicit
    pub fn explicit(mut self) -> Self {
        self.inherited = false;
        self
    }

    /// Grant `privilege` to `principal`
    pub fn grant(mut self, privilege: Privilege, principal: Principal) -> Self {
        self.entries.entry(privilege).or_default().insert(principal);
        self
    }

    /// Grant several privileges to `principal`
    pub fn grant_all(self, privileges: &[Privilege], principal: Principal) -> Self {
        privileges
            .iter()
            .fold(self, |acl, p| acl.grant(*p, principal.clone()))
    }

    /// Remove a grant; empty privilege sets are dropped
    pub fn revoke(mut self, privilege: Privilege, principal: &Principal) -> Self {
        if let Some(set) = self.entries.get_mut(&privilege) {
            set.remove(principal);
            if set.is_empty() {
                self.entries.remove(&privilege);
            }
        }
        self
    }

    /// Principals granted `privilege` (empty if none)
    pub fn principals(&self, privilege: Privilege) -> impl Iterator<Item = &Principal> {
        self.entries.get(&privilege).into_iter().flatten()
    }

    /// True if `principal` appears verbatim in the grant set of `privilege`
    pub fn contains(&self, privilege: Privilege, principal: &Principal) -> bool {
        self.entries
            .get(&privilege)
            .map_or(false, |set| set.contains(principal))
    }

    /// True if nothing is granted for `privilege`
    pub fn is_empty_for(&self, privilege: Privilege) -> bool {
        self.entries.get(&privilege).map_or(true, |set| set.is_empty())
    }

    /// True if the grant tables are equal, ignoring owner and inheritance
    pub fn same_entries(&self, other: &Acl) -> bool {
        self.entries == other.entries
    }

    /// Parse an ACL from JSON
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the ACL to JSON
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Reject ACLs that could lock the owner out or hand write access to everyone
///
/// Runs before an ACL is ever persisted. Checks:
/// - the owner holds `Read`, `Write` and `WriteAcl`, either by name, through
///   the `Owner` pseudo-principal, or through `Authenticated`
/// - `All` is never granted `Write` or `WriteAcl`
/// - the owner is a user
pub fn validate_acl(acl: &Acl) -> Result<()> {
    if !matches!(acl.owner, Principal::User(_)) {
        return Err(RepositoryError::IllegalAcl(format!(
            "owner must be a user, got '{}'",
            acl.owner
        )));
    }

    for privilege in [Privilege::Write, Privilege::WriteAcl] {
        if acl.contains(privilege, &Principal::All) {
            return Err(RepositoryError::IllegalAcl(format!(
                "'{}' cannot be granted to {}",
                privilege,
                Principal::All
            )));
        }
    }

    for privilege in Privilege::OWNER_REQUIRED {
        let owner_granted = acl.principals(privilege).any(|p| match p {
            Principal::Owner | Principal::Authenticated => true,
            Principal::User(_) => *p == acl.owner,
            _ => false,
        });
        if !owner_granted {
            return Err(RepositoryError::IllegalAcl(format!(
                "owner '{}' must be granted '{}'",
                acl.owner, privilege
            )));
        }
    }

    Ok(())
}
