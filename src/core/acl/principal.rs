//! Principals: users, groups and the pseudo-principals matched structurally
//! during evaluation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ALL: &str = "dav:all";
const AUTHENTICATED: &str = "dav:authenticated";
const OWNER: &str = "dav:owner";
const GROUP_PREFIX: &str = "group:";
const USER_PREFIX: &str = "user:";
const RESERVED_PREFIX: &str = "dav:";

/// An identity or pseudo-identity that can appear in an ACL
///
/// Pseudo-principals (`All`, `Authenticated`, `Owner`) never match by string
/// comparison against caller input; the authorization engine matches them by
/// variant.
///
/// The textual form is only used for interchange (JSON ACL documents):
///
/// ```
/// use davrepo::Principal;
///
/// assert_eq!("dav:all".parse::<Principal>().unwrap(), Principal::All);
/// assert_eq!("group:staff".parse::<Principal>().unwrap(), Principal::group("staff"));
/// assert_eq!("alice".parse::<Principal>().unwrap(), Principal::user("alice"));
/// ```
///
/// User ids that would read as another kind of principal are written with an
/// explicit `user:` prefix:
///
/// ```
/// use davrepo::Principal;
///
/// assert_eq!(Principal::user("dav:all").to_string(), "user:dav:all");
/// assert_eq!("user:group:x".parse::<Principal>().unwrap(), Principal::user("group:x"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Principal {
    /// A single user
    User(String),
    /// A named group, membership resolved by a [`PrincipalDirectory`](super::PrincipalDirectory)
    Group(String),
    /// Everybody, including unauthenticated callers
    All,
    /// Any authenticated caller
    Authenticated,
    /// Whoever owns the resource the ACL is attached to
    Owner,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Principal::User(id.into())
    }

    pub fn group(id: impl Into<String>) -> Self {
        Principal::Group(id.into())
    }

    /// True for `All`, `Authenticated` and `Owner`
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            Principal::All | Principal::Authenticated | Principal::Owner
        )
    }

    /// Identity string for users and groups
    pub fn id(&self) -> Option<&str> {
        match self {
            Principal::User(id) | Principal::Group(id) => Some(id),
            _ => None,
        }
    }
}

fn needs_user_prefix(id: &str) -> bool {
    [RESERVED_PREFIX, GROUP_PREFIX, USER_PREFIX]
        .iter()
        .any(|prefix| id.starts_with(prefix))
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::User(id) if needs_user_prefix(id) => write!(f, "{}{}", USER_PREFIX, id),
            Principal::User(id) => write!(f, "{}", id),
            Principal::Group(id) => write!(f, "{}{}", GROUP_PREFIX, id),
            Principal::All => f.write_str(ALL),
            Principal::Authenticated => f.write_str(AUTHENTICATED),
            Principal::Owner => f.write_str(OWNER),
        }
    }
}

impl FromStr for Principal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ALL => Ok(Principal::All),
            AUTHENTICATED => Ok(Principal::Authenticated),
            OWNER => Ok(Principal::Owner),
            "" => Err("principal cannot be empty".to_string()),
            _ if s.starts_with(RESERVED_PREFIX) => {
                Err(format!("unknown pseudo-principal '{}'", s))
            }
            _ => {
                if let Some(user) = s.strip_prefix(USER_PREFIX) {
                    return match user {
                        "" => Err("user id cannot be empty".to_string()),
                        _ => Ok(Principal::user(user)),
                    };
                }
                match s.strip_prefix(GROUP_PREFIX) {
                    Some("") => Err("group name cannot be empty".to_string()),
                    Some(group) => Ok(Principal::group(group)),
                    None => Ok(Principal::user(s)),
                }
            }
        }
    }
}

impl TryFrom<String> for Principal {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Principal> for String {
    fn from(value: Principal) -> Self {
        value.to_string()
    }
}
