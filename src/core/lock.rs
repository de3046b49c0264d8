//! WebDAV-style exclusive write locks
//!
//! A resource is either unlocked or carries one [`ResourceLock`]. Expiry is
//! lazy: a lock whose timeout has passed reads as [`LockState::Unlocked`] and
//! nothing sweeps it here.
//!
//! Transitions:
//! - `Unlocked --acquire--> Locked` (fresh token)
//! - `Locked --refresh(token)--> Locked` (owner only, matching token)
//! - `Locked --release--> Unlocked` (owner or Root)

use crate::core::acl::{Principal, Privilege};
use crate::core::error::{RepositoryError, Result};
use crate::core::resource::Resource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Prefix of every lock token
pub const TOKEN_PREFIX: &str = "opaquelocktoken:";

/// Lock depth; depth `1` is not supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockDepth {
    Zero,
    Infinity,
}

impl FromStr for LockDepth {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" => Ok(LockDepth::Zero),
            "infinity" => Ok(LockDepth::Infinity),
            other => Err(RepositoryError::IllegalOperation(format!(
                "unsupported lock depth '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for LockDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockDepth::Zero => f.write_str("0"),
            LockDepth::Infinity => f.write_str("infinity"),
        }
    }
}

/// An exclusive write lock held on one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Opaque, globally unique token (`opaquelocktoken:<uuid>`)
    pub token: String,
    /// Principal holding the lock
    pub owner: Principal,
    /// Free-form owner information supplied by the client
    pub owner_info: String,
    pub depth: LockDepth,
    /// Absolute expiry instant
    pub timeout: DateTime<Utc>,
}

impl ResourceLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout <= now
    }

    pub fn is_owned_by(&self, principal: &Principal) -> bool {
        self.owner == *principal
    }

    /// Time left before expiry (zero once expired)
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.timeout - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Effective lock state of a resource at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState<'a> {
    Unlocked,
    Locked(&'a ResourceLock),
}

impl<'a> LockState<'a> {
    /// Expired locks read as unlocked
    pub fn of(lock: Option<&'a ResourceLock>, now: DateTime<Utc>) -> Self {
        match lock {
            Some(lock) if !lock.is_expired(now) => LockState::Locked(lock),
            _ => LockState::Unlocked,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked(_))
    }
}

/// Generate a fresh lock token
pub fn new_token() -> String {
    format!("{}{}", TOKEN_PREFIX, Uuid::new_v4())
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|_| RepositoryError::IllegalOperation("lock timeout out of range".to_string()))?;
    now.checked_add_signed(ttl)
        .ok_or_else(|| RepositoryError::IllegalOperation("lock timeout out of range".to_string()))
}

/// `Unlocked --acquire--> Locked`
///
/// The caller has already passed the `Write` ACL check.
pub fn acquire(
    uri: &str,
    state: LockState<'_>,
    principal: &Principal,
    owner_info: &str,
    depth: LockDepth,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<ResourceLock> {
    match state {
        LockState::Locked(_) => Err(RepositoryError::ResourceLocked {
            uri: uri.to_string(),
        }),
        LockState::Unlocked => Ok(ResourceLock {
            token: new_token(),
            owner: principal.clone(),
            owner_info: owner_info.to_string(),
            depth,
            timeout: expiry(now, ttl)?,
        }),
    }
}

/// `Locked --refresh(token)--> Locked` with a new timeout
pub fn refresh(
    uri: &str,
    state: LockState<'_>,
    principal: &Principal,
    token: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<ResourceLock> {
    match state {
        LockState::Unlocked => Err(RepositoryError::IllegalOperation(format!(
            "no active lock to refresh on {}",
            uri
        ))),
        LockState::Locked(lock) if lock.token == token && lock.is_owned_by(principal) => {
            Ok(ResourceLock {
                timeout: expiry(now, ttl)?,
                ..lock.clone()
            })
        }
        LockState::Locked(_) => Err(RepositoryError::ResourceLocked {
            uri: uri.to_string(),
        }),
    }
}

/// `Locked --release--> Unlocked`
///
/// Allowed for the lock owner or a Root caller. A supplied token must match.
pub fn release(
    uri: &str,
    state: LockState<'_>,
    principal: &Principal,
    token: Option<&str>,
    is_root: bool,
) -> Result<()> {
    let LockState::Locked(lock) = state else {
        return Err(RepositoryError::IllegalOperation(format!(
            "{} is not locked",
            uri
        )));
    };

    if !lock.is_owned_by(principal) && !is_root {
        return Err(RepositoryError::ResourceLocked {
            uri: uri.to_string(),
        });
    }

    match token {
        Some(token) if token != lock.token => Err(RepositoryError::IllegalOperation(format!(
            "lock token does not match the lock on {}",
            uri
        ))),
        _ => Ok(()),
    }
}

/// Refuse `Write` on a resource locked by somebody else
///
/// A no-op for every other privilege. `bypass` lets the caller exempt Root.
/// This check runs in addition to the ACL check, never instead of it.
pub fn lock_authorize(
    resource: &Resource,
    principal: Option<&Principal>,
    privilege: Privilege,
    bypass: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    if privilege != Privilege::Write || bypass {
        return Ok(());
    }

    match LockState::of(resource.lock.as_ref(), now) {
        LockState::Locked(lock) if principal.map_or(true, |p| !lock.is_owned_by(p)) => {
            Err(RepositoryError::ResourceLocked {
                uri: resource.uri.clone(),
            })
        }
        _ => Ok(()),
    }
}
