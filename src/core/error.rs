use crate::core::acl::Privilege;
use crate::core::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Authentication required for {privilege} on {uri}")]
    AuthenticationRequired { uri: String, privilege: Privilege },

    #[error("Forbidden: {principal} lacks {privilege} on {uri}")]
    Forbidden {
        uri: String,
        principal: String,
        privilege: Privilege,
    },

    #[error("Resource is locked: {uri}")]
    ResourceLocked { uri: String },

    #[error("Illegal ACL: {0}")]
    IllegalAcl(String),

    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Repository is in read-only mode")]
    ReadOnly,

    #[error("Key lock contention on '{key}' exceeded {rounds} rounds")]
    KeyLockTimeout { key: String, rounds: u32 },

    #[error("Invalid uri: {0}")]
    InvalidUri(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backing store error: {0}")]
    Store(#[from] StoreError),
}

impl RepositoryError {
    /// True for the failures produced by authorization and lock checks.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            RepositoryError::AuthenticationRequired { .. }
                | RepositoryError::Forbidden { .. }
                | RepositoryError::ResourceLocked { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
