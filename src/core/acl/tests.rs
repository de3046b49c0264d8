//! Scenario tests for ACL inheritance and evaluation

use super::*;
use crate::core::error::RepositoryError;
use serde_json::json;
use std::sync::Arc;

fn u1() -> Principal {
    Principal::user("u1")
}

fn u2() -> Principal {
    Principal::user("u2")
}

#[test]
fn test_inherited_acl_scenario() {
    let engine = AuthorizationEngine::new_default();

    // Root grants read/write/write-acl to u1 only; child inherits
    let root = Acl::new(u1()).grant_all(&Privilege::OWNER_REQUIRED, u1());
    assert!(validate_acl(&root).is_ok());
    let child = Acl::inherit_from(&root, u1());

    assert_eq!(
        engine.authorize(&child, &u1(), Some(&u2()), Privilege::Write),
        Decision::Forbidden
    );
    assert!(engine
        .authorize(&child, &u1(), Some(&u1()), Privilege::Write)
        .is_granted());

    // Child now gets an explicit ACL granting write to authenticated callers
    let child = child
        .explicit()
        .grant(Privilege::Write, Principal::Authenticated);
    assert!(validate_acl(&child).is_ok());

    assert!(engine
        .authorize(&child, &u1(), Some(&u2()), Privilege::Write)
        .is_granted());
    assert_eq!(
        engine.authorize(&child, &u1(), None, Privilege::Write),
        Decision::AuthenticationRequired
    );
}

#[test]
fn test_owner_pseudo_principal_follows_resource_owner() {
    let engine = AuthorizationEngine::new_default();
    let root = Acl::default_root(u1());

    // u2 owns the child; the inherited Owner grant now applies to u2
    let child = Acl::inherit_from(&root, u2());
    assert!(engine
        .authorize(&child, &u2(), Some(&u2()), Privilege::Write)
        .is_granted());
    assert_eq!(
        engine.authorize(&child, &u2(), Some(&u1()), Privilege::Write),
        Decision::Forbidden
    );
}

#[test]
fn test_empty_grant_set_short_circuits_group_lookup() {
    struct PanickingDirectory;
    impl PrincipalDirectory for PanickingDirectory {
        fn is_member(&self, _: &Principal, _: &str) -> bool {
            panic!("directory must not be consulted");
        }
    }

    let engine = AuthorizationEngine::new(RoleConfig::default(), Arc::new(PanickingDirectory));
    let acl = Acl::new(u1());
    assert_eq!(
        engine.authorize(&acl, &u1(), Some(&u2()), Privilege::Bind),
        Decision::Forbidden
    );
}

#[test]
fn test_acl_json_document() {
    let document = json!({
        "owner": "u1",
        "entries": {
            "read": ["dav:all"],
            "write": ["dav:owner", "group:editors"],
            "write-acl": ["dav:owner"]
        }
    });

    let acl: Acl = serde_json::from_value(document).unwrap();
    assert!(!acl.inherited);
    assert!(acl.contains(Privilege::Read, &Principal::All));
    assert!(acl.contains(Privilege::Write, &Principal::group("editors")));
    assert!(validate_acl(&acl).is_ok());

    let engine = AuthorizationEngine::new(
        RoleConfig::default(),
        Arc::new(StaticDirectory::new().add_member("editors", u2())),
    );
    assert!(engine.authorize(&acl, &u1(), None, Privilege::Read).is_granted());
    assert!(engine
        .authorize(&acl, &u1(), Some(&u2()), Privilege::Write)
        .is_granted());
    assert_eq!(
        engine.authorize(&acl, &u1(), Some(&u2()), Privilege::WriteAcl),
        Decision::Forbidden
    );
}

#[test]
fn test_escalation_document_rejected() {
    let document = json!({
        "owner": "u1",
        "entries": {
            "read": ["dav:owner"],
            "write": ["dav:owner", "dav:all"],
            "write-acl": ["dav:owner"]
        }
    });

    let acl: Acl = serde_json::from_value(document).unwrap();
    assert!(matches!(
        validate_acl(&acl),
        Err(RepositoryError::IllegalAcl(_))
    ));
}

#[test]
fn test_check_carries_uri() {
    let engine = AuthorizationEngine::new_default();
    let acl = Acl::new(u1());

    match engine.check("/docs/a", &acl, &u1(), Some(&u2()), Privilege::Read) {
        Err(RepositoryError::Forbidden { uri, privilege, .. }) => {
            assert_eq!(uri, "/docs/a");
            assert_eq!(privilege, Privilege::Read);
        }
        other => panic!("unexpected {:?}", other),
    }
}
