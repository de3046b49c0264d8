//! Access control for repository resources
//!
//! Provides:
//! - A tagged [`Principal`] model (users, groups, pseudo-principals)
//! - The closed [`Privilege`] vocabulary
//! - Value-typed [`Acl`]s with snapshot inheritance
//! - [`validate_acl`], the guard run before any ACL is stored
//! - The pure [`AuthorizationEngine`] with injected roles and group directory

mod engine;
mod policy;
mod principal;

pub use engine::{
    AuthorizationEngine, Decision, PrincipalDirectory, Role, RoleConfig, StaticDirectory,
};
pub use policy::{validate_acl, Acl, Privilege};
pub use principal::Principal;

#[cfg(test)]
mod tests;
