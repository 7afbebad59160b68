//! Error types for circle operations.
//!
//! One variant per failure kind so the presentation layer can map errors
//! to status codes without string matching. Only storage-level failures
//! are transient; every other kind is deterministic and must not be
//! retried, since retrying cannot change the outcome.

use thiserror::Error;

use crate::scope::{format_scopes, Scope, ScopeError, ScopeSet};

use super::types::DelegationStatus;

/// Error type for circle operations.
#[derive(Error, Debug)]
pub enum CircleError {
    /// Storage operation failed. Transient; eligible for caller retry.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error from `SQLite`. Transient; eligible for caller retry.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Circle, role, membership, or delegation not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A circle with the same slug already exists.
    #[error("Circle already exists: {0}")]
    AlreadyExists(String),

    /// Empty or otherwise unusable name.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// A delegation was requested with no scopes.
    #[error("Delegation requires a non-empty scope set")]
    EmptyScopeSet,

    /// An expiry timestamp that is not strictly in the future.
    #[error("Expiry must be in the future: {0}")]
    InvalidExpiry(i64),

    /// A scope identifier outside the catalog. Configuration bug; fatal.
    #[error("Unknown scope: {0}")]
    UnknownScope(String),

    /// The acting principal lacks the scope required for an operation.
    #[error("Insufficient scope: {action} requires {}", .required.as_str())]
    InsufficientScope {
        /// The scope the action requires.
        required: Scope,
        /// The attempted action.
        action: &'static str,
    },

    /// A delegation requested scopes the delegator does not hold.
    #[error("Delegator does not hold: {}", format_scopes(.missing))]
    ScopeNotHeld {
        /// The requested scopes not satisfied by the delegator's
        /// effective role scopes.
        missing: ScopeSet,
    },

    /// The owner role cannot be modified, and memberships cannot move to
    /// or from it.
    #[error("Owner role is immutable")]
    OwnerRoleImmutable,

    /// The owner membership cannot be removed from its circle.
    #[error("Cannot remove the owner membership")]
    CannotRemoveOwner,

    /// An owner role was requested outside circle creation.
    #[error("A circle has exactly one owner role")]
    DuplicateRoleLevelOwner,

    /// The delegation is already revoked or expired.
    ///
    /// Idempotency signal: the record is already in a terminal state and
    /// was not changed. Callers may treat this as success-equivalent.
    #[error("Delegation already terminal: {}", .0.as_str())]
    AlreadyTerminal(DelegationStatus),

    /// The circle is not active; all mutations are frozen.
    #[error("Circle is not active: {0}")]
    CircleArchived(String),

    /// The principal already holds an active membership in the circle.
    #[error("Principal already an active member: {0}")]
    DuplicatePrincipal(String),

    /// The role belongs to a different circle.
    #[error("Role does not belong to circle: {0}")]
    RoleNotInCircle(String),

    /// Invalid data read back from storage.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Operation recognized but deliberately not supported by this core.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Result type alias for circle operations.
pub type Result<T> = std::result::Result<T, CircleError>;

impl CircleError {
    /// Returns whether the error is transient and eligible for retry.
    ///
    /// Only storage failures qualify. Invariant and authorization failures
    /// are deterministic: retrying them cannot change the outcome.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Database(_))
    }
}

impl From<ScopeError> for CircleError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::UnknownScope(name) => Self::UnknownScope(name),
        }
    }
}
