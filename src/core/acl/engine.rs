//! ACL evaluation engine
//!
//! Evaluates a resource's [`Acl`] for a caller and a privilege. Evaluation is
//! pure: the engine holds only immutable role configuration and a handle to
//! the principal directory, so a single engine is shared by every thread.
//!
//! Rules, first match wins:
//! 1. `ReadProcessed` is granted whenever `Read` is
//! 2. `All` in the grant set grants without an identity
//! 3. no identity → authentication required
//! 4. `Authenticated` in the grant set
//! 5. the Root role
//! 6. the ReadEverything role, for `Read` only
//! 7. empty grant set → forbidden
//! 8. `Owner` in the grant set and the caller owns the resource
//! 9. the caller listed by name
//! 10. the caller is a member of a listed group
//! 11. forbidden

use super::{Acl, Principal, Privilege};
use crate::core::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Administrative roles assigned outside of ACLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Bypasses every ACL check
    Root,
    /// Bypasses `Read` checks
    ReadEverything,
}

/// Immutable role assignment, injected at construction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// User ids holding [`Role::Root`]
    pub root: BTreeSet<String>,
    /// User ids holding [`Role::ReadEverything`]
    pub read_everything: BTreeSet<String>,
}

impl RoleConfig {
    pub fn with_root(mut self, id: impl Into<String>) -> Self {
        self.root.insert(id.into());
        self
    }

    pub fn with_read_everything(mut self, id: impl Into<String>) -> Self {
        self.read_everything.insert(id.into());
        self
    }

    /// Roles held by `principal` (only users hold roles)
    pub fn roles(&self, principal: &Principal) -> BTreeSet<Role> {
        let mut roles = BTreeSet::new();
        if let Principal::User(id) = principal {
            if self.root.contains(id) {
                roles.insert(Role::Root);
            }
            if self.read_everything.contains(id) {
                roles.insert(Role::ReadEverything);
            }
        }
        roles
    }
}

/// Group membership lookup
///
/// Membership may be transitive; the engine asks once per group entry and does
/// not care how the answer is computed.
pub trait PrincipalDirectory: Send + Sync {
    fn is_member(&self, principal: &Principal, group: &str) -> bool;
}

/// In-memory principal directory with nested groups
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    members: HashMap<String, HashSet<Principal>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` (a user or a nested group) to `group`
    pub fn add_member(mut self, group: impl Into<String>, member: Principal) -> Self {
        self.members.entry(group.into()).or_default().insert(member);
        self
    }
}

impl PrincipalDirectory for StaticDirectory {
    fn is_member(&self, principal: &Principal, group: &str) -> bool {
        let mut visited = HashSet::new();
        let mut pending = vec![group];

        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(members) = self.members.get(current) else {
                continue;
            };
            if members.contains(principal) {
                return true;
            }
            pending.extend(members.iter().filter_map(|m| match m {
                Principal::Group(nested) => Some(nested.as_str()),
                _ => None,
            }));
        }

        false
    }
}

/// Outcome of a single evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    AuthenticationRequired,
    Forbidden,
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }

    /// Turn a denial into the matching [`RepositoryError`]
    pub fn into_result(
        self,
        uri: &str,
        principal: Option<&Principal>,
        privilege: Privilege,
    ) -> Result<()> {
        match self {
            Decision::Granted => Ok(()),
            Decision::AuthenticationRequired => Err(RepositoryError::AuthenticationRequired {
                uri: uri.to_string(),
                privilege,
            }),
            Decision::Forbidden => Err(RepositoryError::Forbidden {
                uri: uri.to_string(),
                principal: principal.map(|p| p.to_string()).unwrap_or_default(),
                privilege,
            }),
        }
    }
}

/// ACL evaluation engine
#[derive(Clone)]
pub struct AuthorizationEngine {
    roles: RoleConfig,
    directory: Arc<dyn PrincipalDirectory>,
}

impl AuthorizationEngine {
    /// Create an engine over a role configuration and a principal directory
    pub fn new(roles: RoleConfig, directory: Arc<dyn PrincipalDirectory>) -> Self {
        AuthorizationEngine { roles, directory }
    }

    /// Engine without roles or groups
    pub fn new_default() -> Self {
        Self::new(RoleConfig::default(), Arc::new(StaticDirectory::new()))
    }

    pub fn roles(&self) -> &RoleConfig {
        &self.roles
    }

    /// True if `principal` holds `role`
    pub fn has_role(&self, principal: Option<&Principal>, role: Role) -> bool {
        principal.map_or(false, |p| self.roles.roles(p).contains(&role))
    }

    /// Evaluate `privilege` for `principal` (`None` = unauthenticated)
    ///
    /// # Examples
    ///
    /// ```
    /// use davrepo::{Acl, AuthorizationEngine, Decision, Principal, Privilege};
    ///
    /// let engine = AuthorizationEngine::new_default();
    /// let owner = Principal::user("alice");
    /// let acl = Acl::new(owner.clone()).grant(Privilege::Read, Principal::All);
    ///
    /// assert_eq!(engine.authorize(&acl, &owner, None, Privilege::Read), Decision::Granted);
    /// assert_eq!(
    ///     engine.authorize(&acl, &owner, None, Privilege::Write),
    ///     Decision::AuthenticationRequired
    /// );
    /// ```
    pub fn authorize(
        &self,
        acl: &Acl,
        owner: &Principal,
        principal: Option<&Principal>,
        privilege: Privilege,
    ) -> Decision {
        let roles = principal.map(|p| self.roles.roles(p)).unwrap_or_default();
        let decision = self.evaluate(acl, owner, principal, &roles, privilege);
        trace!(
            "authorize {} for {:?} -> {:?}",
            privilege,
            principal.map(|p| p.to_string()),
            decision
        );
        decision
    }

    /// Evaluate with an explicit role set
    pub fn evaluate(
        &self,
        acl: &Acl,
        owner: &Principal,
        principal: Option<&Principal>,
        roles: &BTreeSet<Role>,
        privilege: Privilege,
    ) -> Decision {
        if privilege == Privilege::ReadProcessed
            && self
                .evaluate(acl, owner, principal, roles, Privilege::Read)
                .is_granted()
        {
            return Decision::Granted;
        }

        if acl.contains(privilege, &Principal::All) {
            return Decision::Granted;
        }

        let Some(principal) = principal else {
            return Decision::AuthenticationRequired;
        };

        if acl.contains(privilege, &Principal::Authenticated) {
            return Decision::Granted;
        }

        if roles.contains(&Role::Root) {
            return Decision::Granted;
        }

        if privilege == Privilege::Read && roles.contains(&Role::ReadEverything) {
            return Decision::Granted;
        }

        if acl.is_empty_for(privilege) {
            return Decision::Forbidden;
        }

        if principal == owner && acl.contains(privilege, &Principal::Owner) {
            return Decision::Granted;
        }

        if acl.contains(privilege, principal) {
            return Decision::Granted;
        }

        let member_of_granted_group = acl.principals(privilege).any(|p| match p {
            Principal::Group(group) => self.directory.is_member(principal, group),
            _ => false,
        });
        if member_of_granted_group {
            return Decision::Granted;
        }

        Decision::Forbidden
    }

    /// Authorize and convert a denial into an error carrying `uri`
    pub fn check(
        &self,
        uri: &str,
        acl: &Acl,
        owner: &Principal,
        principal: Option<&Principal>,
        privilege: Privilege,
    ) -> Result<()> {
        self.authorize(acl, owner, principal, privilege)
            .into_result(uri, principal, privilege)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Principal {
        Principal::user("alice")
    }

    fn bob() -> Principal {
        Principal::user("bob")
    }

    #[test]
    fn test_all_grants_without_identity() {
        let engine = AuthorizationEngine::new_default();
        let acl = Acl::new(alice()).grant(Privilege::Read, Principal::All);

        assert_eq!(
            engine.authorize(&acl, &alice(), None, Privilege::Read),
            Decision::Granted
        );
        assert_eq!(
            engine.authorize(&acl, &alice(), None, Privilege::Write),
            Decision::AuthenticationRequired
        );
    }

    #[test]
    fn test_read_processed_falls_back_to_read() {
        let engine = AuthorizationEngine::new_default();
        let acl = Acl::new(alice()).grant(Privilege::Read, bob());

        assert!(engine
            .authorize(&acl, &alice(), Some(&bob()), Privilege::ReadProcessed)
            .is_granted());

        // A distinct grant works without Read
        let acl = Acl::new(alice()).grant(Privilege::ReadProcessed, bob());
        assert!(engine
            .authorize(&acl, &alice(), Some(&bob()), Privilege::ReadProcessed)
            .is_granted());
        assert!(!engine
            .authorize(&acl, &alice(), Some(&bob()), Privilege::Read)
            .is_granted());
    }

    #[test]
    fn test_owner_pseudo_principal() {
        let engine = AuthorizationEngine::new_default();
        let acl = Acl::new(alice()).grant(Privilege::Write, Principal::Owner);

        assert!(engine
            .authorize(&acl, &alice(), Some(&alice()), Privilege::Write)
            .is_granted());
        assert_eq!(
            engine.authorize(&acl, &alice(), Some(&bob()), Privilege::Write),
            Decision::Forbidden
        );
    }

    #[test]
    fn test_roles() {
        let roles = RoleConfig::default()
            .with_root("root")
            .with_read_everything("auditor");
        let engine = AuthorizationEngine::new(roles, Arc::new(StaticDirectory::new()));
        let acl = Acl::new(alice());

        let root = Principal::user("root");
        let auditor = Principal::user("auditor");

        assert!(engine
            .authorize(&acl, &alice(), Some(&root), Privilege::WriteAcl)
            .is_granted());
        assert!(engine
            .authorize(&acl, &alice(), Some(&auditor), Privilege::Read)
            .is_granted());
        assert!(engine
            .authorize(&acl, &alice(), Some(&auditor), Privilege::ReadProcessed)
            .is_granted());
        assert_eq!(
            engine.authorize(&acl, &alice(), Some(&auditor), Privilege::Write),
            Decision::Forbidden
        );
        assert!(engine.has_role(Some(&root), Role::Root));
        assert!(!engine.has_role(None, Role::Root));
    }

    #[test]
    fn test_group_membership() {
        let directory = StaticDirectory::new()
            .add_member("staff", Principal::group("editors"))
            .add_member("editors", bob());
        let engine = AuthorizationEngine::new(RoleConfig::default(), Arc::new(directory));
        let acl = Acl::new(alice()).grant(Privilege::Write, Principal::group("staff"));

        // Nested membership resolves transitively
        assert!(engine
            .authorize(&acl, &alice(), Some(&bob()), Privilege::Write)
            .is_granted());
        assert_eq!(
            engine.authorize(&acl, &alice(), Some(&Principal::user("carol")), Privilege::Write),
            Decision::Forbidden
        );
    }

    #[test]
    fn test_directory_cycle_terminates() {
        let directory = StaticDirectory::new()
            .add_member("a", Principal::group("b"))
            .add_member("b", Principal::group("a"));
        assert!(!directory.is_member(&bob(), "a"));
    }

    #[test]
    fn test_decision_into_result() {
        assert!(Decision::Granted
            .into_result("/a", None, Privilege::Read)
            .is_ok());
        assert!(matches!(
            Decision::AuthenticationRequired.into_result("/a", None, Privilege::Read),
            Err(RepositoryError::AuthenticationRequired { .. })
        ));
        match Decision::Forbidden.into_result("/a", Some(&bob()), Privilege::Write) {
            Err(RepositoryError::Forbidden { uri, principal, .. }) => {
                assert_eq!(uri, "/a");
                assert_eq!(principal, "bob");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
