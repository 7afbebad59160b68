//! Abstract persistence interface for the circle engine.
//!
//! The engine persists through this trait so the concrete storage engine
//! stays an external collaborator. [`SqliteStore`] is the bundled
//! implementation; alternative backends implement the same contract.
//!
//! # Contract
//!
//! - Every method is a single atomic operation: concurrent readers never
//!   observe intermediate state, and a failure leaves nothing applied.
//! - Conditional mutations guard on the expected current state and return
//!   whether the write applied, so terminal-state races resolve to exactly
//!   one winner. Losers observe `false` and report the conflict.
//! - Implementations must be safe to share across threads and across
//!   stateless service instances; guards must use the store's native
//!   transaction or compare-and-swap facility, not in-process locks.
//!
//! [`SqliteStore`]: super::storage::SqliteStore

use super::error::Result;
use super::types::{
    Circle, CircleId, CircleStatus, Delegation, DelegationId, Membership, MembershipId, Principal,
    Role, RoleId,
};
use crate::scope::ScopeSet;

/// Persistence operations required by the circle engine.
///
/// Validation of domain invariants (owner immutability, scope subset
/// rules, archived-circle freezes) happens in the engine; the store only
/// enforces record-level uniqueness and state guards.
pub trait CircleStore: Send + Sync {
    // ==================== Circles ====================

    /// Atomically creates a circle together with its owner role and owner
    /// membership. All three records appear, or none do.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the slug is taken, or a storage error.
    fn create_circle_with_owner(
        &self,
        circle: &Circle,
        owner_role: &Role,
        owner_membership: &Membership,
    ) -> Result<()>;

    /// Returns a circle by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    fn get_circle(&self, id: &CircleId) -> Result<Option<Circle>>;

    /// Moves a circle from `expected` status to archived.
    ///
    /// Returns `false` if the circle was not in `expected` status.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn archive_circle(&self, id: &CircleId, expected: CircleStatus) -> Result<bool>;

    // ==================== Roles ====================

    /// Inserts a role.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRoleLevelOwner` if an owner role already exists
    /// for the circle, or a storage error.
    fn insert_role(&self, role: &Role) -> Result<()>;

    /// Returns a role by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    fn get_role(&self, id: &RoleId) -> Result<Option<Role>>;

    /// Returns the owner role of a circle.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    fn owner_role(&self, circle_id: &CircleId) -> Result<Option<Role>>;

    /// Replaces a role's scope set. Returns `false` if the role does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn update_role_scopes(&self, id: &RoleId, scopes: &ScopeSet) -> Result<bool>;

    // ==================== Memberships ====================

    /// Inserts a membership.
    ///
    /// # Errors
    ///
    /// Returns `DuplicatePrincipal` if the principal already holds an
    /// active membership in the circle, or a storage error.
    fn insert_membership(&self, membership: &Membership) -> Result<()>;

    /// Returns a membership by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    fn get_membership(&self, id: &MembershipId) -> Result<Option<Membership>>;

    /// Returns the active membership of a principal in a circle, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    fn find_active_membership(
        &self,
        circle_id: &CircleId,
        principal: &Principal,
    ) -> Result<Option<Membership>>;

    /// Changes the role of an active membership. Returns `false` if the
    /// membership does not exist or is no longer active.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn update_membership_role(&self, id: &MembershipId, new_role: &RoleId) -> Result<bool>;

    /// Deactivates an active membership and, in the same transaction,
    /// revokes every active unexpired delegation it granted. Returns
    /// `false` if the membership was not active (nothing is changed).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn deactivate_membership(
        &self,
        id: &MembershipId,
        left_at: i64,
        revoked_by: &Principal,
    ) -> Result<bool>;

    // ==================== Delegations ====================

    /// Inserts a delegation.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn insert_delegation(&self, delegation: &Delegation) -> Result<()>;

    /// Returns a delegation by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    fn get_delegation(&self, id: &DelegationId) -> Result<Option<Delegation>>;

    /// Returns all delegations granted to a principal in a circle,
    /// regardless of status. Callers apply lazy expiry resolution.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    fn delegations_for_delegatee(
        &self,
        circle_id: &CircleId,
        delegatee: &Principal,
    ) -> Result<Vec<Delegation>>;

    /// Revokes a delegation, guarded on it being stored active and not
    /// past its expiry at `now`. Records the revocation timestamp and
    /// revoker. Returns `false` if the guard did not match.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn revoke_delegation(
        &self,
        id: &DelegationId,
        now: i64,
        revoked_by: &Principal,
    ) -> Result<bool>;

    /// Persists the expired transition, guarded on the delegation being
    /// stored active with an expiry at or before `now`. Returns `false`
    /// if the guard did not match.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn expire_delegation(&self, id: &DelegationId, now: i64) -> Result<bool>;
}
