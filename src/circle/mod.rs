//! Circle membership and delegation engine.
//!
//! This module provides the core functionality for "coordination circles" -
//! federated groups whose members act on each other's behalf through
//! roles and time-bounded delegations. It decides effective permissions;
//! the presentation layer resolves display names, routes requests, and
//! maps the error taxonomy to status codes.
//!
//! # Architecture
//!
//! ```text
//! CircleManager (high-level API)
//!     ├── ScopeCatalog (implication closure, process-wide)
//!     └── CircleStore (persistence trait)
//!             └── SqliteStore (bundled implementation)
//! ```
//!
//! # Trust Model
//!
//! - **Roles** bundle scopes per circle; the single owner role carries
//!   the full catalog and is immutable.
//! - **Memberships** bind a principal to a circle via a role; at most one
//!   active membership per principal per circle.
//! - **Delegations** grant a subset of the delegator's role scopes to
//!   another principal, optionally time-bounded, revocable, and never
//!   transitive.
//! - **`authorize`** is the single decision point: role scopes ∪ active
//!   delegated scopes, checked through the catalog's implication closure.
//!
//! # Types
//!
//! - [`Circle`]: a federated group scoping everything below
//! - [`Role`]: a named scope bundle with a trust level
//! - [`Membership`]: a principal bound to a circle via a role
//! - [`Delegation`]: a time-bounded, scope-limited grant
//! - [`AccessDecision`]: the outcome of an authorization check

mod error;
mod manager;
mod storage;
mod store;
pub mod types;

pub use error::{CircleError, Result};
pub use manager::{CircleCreation, CircleManager};
pub use storage::SqliteStore;
pub use store::CircleStore;
pub use types::{
    AccessDecision, Circle, CircleId, CircleStatus, Delegation, DelegationId, DelegationStatus,
    GrantSource, Membership, MembershipId, Principal, Role, RoleId, RoleLevel, ScopeContribution,
};
