//! High-level circle management API.
//!
//! This module provides the [`CircleManager`] which combines the scope
//! catalog with a [`CircleStore`] backend to provide a unified API for
//! circle lifecycle, roles, memberships, delegations, and authorization.
//!
//! # Authorization Model
//!
//! `authorize` is the single entry point application code calls before
//! permitting a scoped action. It composes the caller's membership role
//! scopes with active delegated scopes and checks the requirement against
//! the catalog's implication closure. Administrative mutations validate
//! their own invariants and re-check the acting principal where the
//! operation demands it (`remove_member`, `change_member_role`,
//! `revoke_delegation`, `archive_circle`).

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::error::{CircleError, Result};
use super::storage::SqliteStore;
use super::store::CircleStore;
use super::types::{
    slugify, AccessDecision, Circle, CircleId, CircleStatus, Delegation, DelegationId,
    DelegationStatus, GrantSource, Membership, MembershipId, Principal, Role, RoleId, RoleLevel,
    ScopeContribution,
};
use crate::scope::{Scope, ScopeCatalog, ScopeSet};

/// High-level API for circle membership and delegation.
///
/// Combines the global scope catalog with a persistence backend to
/// provide a unified interface for deciding who may act on behalf of
/// whom, with what scope, for how long.
///
/// # Example
///
/// ```ignore
/// use std::path::Path;
/// use circle_core::circle::CircleManager;
///
/// let manager = CircleManager::new(Path::new("/data/circles"))?;
/// let created = manager.create_circle("Garden Crew", &owner)?;
/// ```
pub struct CircleManager {
    store: Arc<dyn CircleStore>,
    catalog: &'static ScopeCatalog,
}

impl CircleManager {
    /// Creates a new circle manager with `SQLite` storage.
    ///
    /// Creates the data directory and database if they don't exist.
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Base directory for circle data
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| CircleError::Storage(format!("Failed to create data directory: {e}")))?;

        let db_path = data_dir.join("circles.db");
        let store = SqliteStore::new(&db_path)?;

        Ok(Self::with_store(Arc::new(store)))
    }

    /// Creates a circle manager over an externally provided store.
    ///
    /// Use this to run the engine against an alternative [`CircleStore`]
    /// implementation.
    #[must_use]
    pub fn with_store(store: Arc<dyn CircleStore>) -> Self {
        Self {
            store,
            catalog: ScopeCatalog::global(),
        }
    }

    /// Creates a circle manager with in-memory storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_store(Arc::new(SqliteStore::in_memory()?)))
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    // ==================== Circle Lifecycle ====================

    /// Creates a new circle.
    ///
    /// Atomically creates the circle, its owner role (granting the full
    /// scope catalog), and the owner's membership.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName` if the name is empty or yields an empty slug,
    /// `AlreadyExists` if the slug is taken.
    pub fn create_circle(&self, name: &str, owner: &Principal) -> Result<CircleCreation> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CircleError::InvalidName(name.to_string()));
        }
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(CircleError::InvalidName(name.to_string()));
        }

        let now = Self::now();
        let circle = Circle {
            id: CircleId::generate(),
            display_name: name.to_string(),
            slug,
            status: CircleStatus::Active,
            created_at: now,
        };
        let owner_role = Role {
            id: RoleId::generate(),
            circle_id: circle.id.clone(),
            name: "Owner".to_string(),
            level: RoleLevel::Owner,
            scopes: self.catalog.scopes(),
            created_at: now,
        };
        let owner_membership = Membership {
            id: MembershipId::generate(),
            circle_id: circle.id.clone(),
            principal: owner.clone(),
            role_id: owner_role.id.clone(),
            is_active: true,
            joined_at: now,
            left_at: None,
        };

        self.store
            .create_circle_with_owner(&circle, &owner_role, &owner_membership)?;

        info!(circle = %circle.id, slug = %circle.slug, owner = %owner, "created circle");

        Ok(CircleCreation {
            circle,
            owner_role,
            owner_membership,
        })
    }

    /// Retrieves a circle by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_circle(&self, circle_id: &CircleId) -> Result<Option<Circle>> {
        self.store.get_circle(circle_id)
    }

    /// Archives a circle, freezing all further mutations.
    ///
    /// History is preserved: nothing is deleted, and existing memberships
    /// and delegations remain readable.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientScope` unless the acting principal's effective
    /// scopes include `manage_circle`, `CircleArchived` if the circle is
    /// already frozen.
    pub fn archive_circle(&self, circle_id: &CircleId, acting: &Principal) -> Result<Circle> {
        self.require_active_circle(circle_id)?;
        self.require_effective_scope(circle_id, acting, Scope::ManageCircle, "archive_circle")?;

        if !self.store.archive_circle(circle_id, CircleStatus::Active)? {
            return Err(CircleError::CircleArchived(circle_id.to_string()));
        }

        info!(circle = %circle_id, acting = %acting, "archived circle");

        self.store
            .get_circle(circle_id)?
            .ok_or_else(|| CircleError::NotFound(format!("circle {circle_id}")))
    }

    // ==================== Role Management ====================

    /// Creates a role in a circle.
    ///
    /// Only non-owner levels may be created: the single owner role exists
    /// from circle creation.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRoleLevelOwner` if the owner level is requested,
    /// `InvalidName` if the name is empty, `CircleArchived` if the circle
    /// is frozen.
    pub fn create_role(
        &self,
        circle_id: &CircleId,
        name: &str,
        scopes: ScopeSet,
        level: RoleLevel,
    ) -> Result<Role> {
        self.require_active_circle(circle_id)?;
        if level.is_owner() {
            return Err(CircleError::DuplicateRoleLevelOwner);
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(CircleError::InvalidName(name.to_string()));
        }

        let role = Role {
            id: RoleId::generate(),
            circle_id: circle_id.clone(),
            name: name.to_string(),
            level,
            scopes,
            created_at: Self::now(),
        };
        self.store.insert_role(&role)?;

        debug!(circle = %circle_id, role = %role.id, name = %role.name, "created role");

        Ok(role)
    }

    /// Replaces a role's scope set.
    ///
    /// Already-issued delegations are frozen grants: they are not
    /// re-validated or revoked when the role shrinks.
    ///
    /// # Errors
    ///
    /// Returns `OwnerRoleImmutable` for the owner role, `NotFound` if the
    /// role does not exist, `CircleArchived` if the circle is frozen.
    pub fn update_role_scopes(&self, role_id: &RoleId, scopes: ScopeSet) -> Result<Role> {
        let role = self
            .store
            .get_role(role_id)?
            .ok_or_else(|| CircleError::NotFound(format!("role {role_id}")))?;
        if role.level.is_owner() {
            return Err(CircleError::OwnerRoleImmutable);
        }
        self.require_active_circle(&role.circle_id)?;

        if !self.store.update_role_scopes(role_id, &scopes)? {
            return Err(CircleError::NotFound(format!("role {role_id}")));
        }

        debug!(role = %role_id, "updated role scopes");

        Ok(Role { scopes, ..role })
    }

    /// Transfers circle ownership to another principal.
    ///
    /// Not supported by this core: ownership is fixed at circle creation.
    ///
    /// # Errors
    ///
    /// Always returns `Unsupported` (after confirming the circle exists).
    pub fn transfer_ownership(&self, circle_id: &CircleId, _to: &Principal) -> Result<()> {
        self.require_circle(circle_id)?;
        Err(CircleError::Unsupported("ownership transfer"))
    }

    // ==================== Member Management ====================

    /// Adds a member to a circle.
    ///
    /// Callers gate this with `authorize(circle, actor, manage_members)`;
    /// the engine validates state invariants only.
    ///
    /// # Errors
    ///
    /// Returns `CircleArchived` if the circle is not active,
    /// `DuplicatePrincipal` if the principal already holds an active
    /// membership, `RoleNotInCircle` if the role belongs to a different
    /// circle, `OwnerRoleImmutable` if the owner role is requested.
    pub fn add_member(
        &self,
        circle_id: &CircleId,
        principal: Principal,
        role_id: &RoleId,
    ) -> Result<Membership> {
        self.require_active_circle(circle_id)?;

        let role = self
            .store
            .get_role(role_id)?
            .ok_or_else(|| CircleError::NotFound(format!("role {role_id}")))?;
        if role.circle_id != *circle_id {
            return Err(CircleError::RoleNotInCircle(role_id.to_string()));
        }
        if role.level.is_owner() {
            return Err(CircleError::OwnerRoleImmutable);
        }
        if self
            .store
            .find_active_membership(circle_id, &principal)?
            .is_some()
        {
            return Err(CircleError::DuplicatePrincipal(principal.storage_key()));
        }

        let membership = Membership {
            id: MembershipId::generate(),
            circle_id: circle_id.clone(),
            principal,
            role_id: role_id.clone(),
            is_active: true,
            joined_at: Self::now(),
            left_at: None,
        };
        self.store.insert_membership(&membership)?;

        debug!(circle = %circle_id, membership = %membership.id, principal = %membership.principal, "added member");

        Ok(membership)
    }

    /// Removes a member from a circle.
    ///
    /// Marks the membership inactive (the row is history, never deleted)
    /// and atomically revokes every active delegation it granted, so the
    /// member's delegatees lose those scopes immediately.
    ///
    /// # Errors
    ///
    /// Returns `CannotRemoveOwner` for the owner membership,
    /// `InsufficientScope` unless the acting principal's effective scopes
    /// include `manage_members`, `CircleArchived` if the circle is frozen.
    pub fn remove_member(
        &self,
        circle_id: &CircleId,
        membership_id: &MembershipId,
        acting: &Principal,
    ) -> Result<()> {
        self.require_active_circle(circle_id)?;

        let membership = self
            .store
            .get_membership(membership_id)?
            .filter(|m| m.circle_id == *circle_id && m.is_active)
            .ok_or_else(|| CircleError::NotFound(format!("membership {membership_id}")))?;

        let role = self
            .store
            .get_role(&membership.role_id)?
            .ok_or_else(|| CircleError::NotFound(format!("role {}", membership.role_id)))?;
        if role.level.is_owner() {
            return Err(CircleError::CannotRemoveOwner);
        }

        self.require_effective_scope(circle_id, acting, Scope::ManageMembers, "remove_member")?;

        let now = Self::now();
        if !self.store.deactivate_membership(membership_id, now, acting)? {
            return Err(CircleError::NotFound(format!("membership {membership_id}")));
        }

        info!(circle = %circle_id, membership = %membership_id, acting = %acting, "removed member");

        Ok(())
    }

    /// Changes a member's role.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientScope` unless the acting principal's effective
    /// scopes include `manage_members`, `OwnerRoleImmutable` if either the
    /// current or the new role is the owner role, `RoleNotInCircle` if the
    /// new role belongs to a different circle.
    pub fn change_member_role(
        &self,
        membership_id: &MembershipId,
        new_role_id: &RoleId,
        acting: &Principal,
    ) -> Result<Membership> {
        let membership = self
            .store
            .get_membership(membership_id)?
            .filter(|m| m.is_active)
            .ok_or_else(|| CircleError::NotFound(format!("membership {membership_id}")))?;
        self.require_active_circle(&membership.circle_id)?;

        self.require_effective_scope(
            &membership.circle_id,
            acting,
            Scope::ManageMembers,
            "change_member_role",
        )?;

        let current_role = self
            .store
            .get_role(&membership.role_id)?
            .ok_or_else(|| CircleError::NotFound(format!("role {}", membership.role_id)))?;
        if current_role.level.is_owner() {
            return Err(CircleError::OwnerRoleImmutable);
        }

        let new_role = self
            .store
            .get_role(new_role_id)?
            .ok_or_else(|| CircleError::NotFound(format!("role {new_role_id}")))?;
        if new_role.level.is_owner() {
            return Err(CircleError::OwnerRoleImmutable);
        }
        if new_role.circle_id != membership.circle_id {
            return Err(CircleError::RoleNotInCircle(new_role_id.to_string()));
        }

        if !self.store.update_membership_role(membership_id, new_role_id)? {
            return Err(CircleError::NotFound(format!("membership {membership_id}")));
        }

        debug!(membership = %membership_id, role = %new_role_id, acting = %acting, "changed member role");

        Ok(Membership {
            role_id: new_role_id.clone(),
            ..membership
        })
    }

    /// Returns the role scopes a membership currently grants.
    ///
    /// Pure read: the role's scope set while the membership is active,
    /// the empty set once it is not.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the membership does not exist.
    pub fn effective_role_scopes(&self, membership_id: &MembershipId) -> Result<ScopeSet> {
        let membership = self
            .store
            .get_membership(membership_id)?
            .ok_or_else(|| CircleError::NotFound(format!("membership {membership_id}")))?;
        self.role_scopes_of(&membership)
    }

    // ==================== Delegations ====================

    /// Creates a delegation from a member to a principal.
    ///
    /// The requested scopes must be satisfied by the implication closure
    /// of the delegator's effective *role* scopes. Scopes the delegator
    /// itself only holds through an inbound delegation do not count:
    /// delegation is not transitive.
    ///
    /// # Errors
    ///
    /// Returns `CircleArchived` if the circle is not active, `NotFound`
    /// if the delegator membership is missing, inactive, or in another
    /// circle, `EmptyScopeSet` for an empty request, `InvalidExpiry` unless
    /// `expires_at` is strictly in the future, `ScopeNotHeld` listing the
    /// unsatisfied scopes otherwise.
    pub fn create_delegation(
        &self,
        circle_id: &CircleId,
        delegator_membership_id: &MembershipId,
        delegatee: Principal,
        scopes: ScopeSet,
        expires_at: Option<i64>,
    ) -> Result<Delegation> {
        self.require_active_circle(circle_id)?;

        let delegator = self
            .store
            .get_membership(delegator_membership_id)?
            .filter(|m| m.circle_id == *circle_id && m.is_active)
            .ok_or_else(|| {
                CircleError::NotFound(format!("membership {delegator_membership_id}"))
            })?;

        if scopes.is_empty() {
            return Err(CircleError::EmptyScopeSet);
        }

        let now = Self::now();
        if let Some(at) = expires_at {
            if at <= now {
                return Err(CircleError::InvalidExpiry(at));
            }
        }

        let held = self.role_scopes_of(&delegator)?;
        let missing = self.catalog.unsatisfied(&held, &scopes);
        if !missing.is_empty() {
            return Err(CircleError::ScopeNotHeld { missing });
        }

        let delegation = Delegation {
            id: DelegationId::generate(),
            circle_id: circle_id.clone(),
            delegator_membership_id: delegator_membership_id.clone(),
            delegatee,
            scopes,
            status: DelegationStatus::Active,
            expires_at,
            created_at: now,
            revoked_at: None,
            revoked_by: None,
        };
        self.store.insert_delegation(&delegation)?;

        debug!(
            circle = %circle_id,
            delegation = %delegation.id,
            delegatee = %delegation.delegatee,
            "created delegation"
        );

        Ok(delegation)
    }

    /// Revokes a delegation.
    ///
    /// Permitted for the original delegator, any principal whose effective
    /// scopes in the circle include `manage_members`, or the owner (whose
    /// role always carries the full catalog). Records the revocation
    /// timestamp and revoker exactly once.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyTerminal` if the delegation is already revoked or
    /// (lazily) expired, `InsufficientScope` if the acting principal is
    /// not permitted.
    pub fn revoke_delegation(
        &self,
        delegation_id: &DelegationId,
        acting: &Principal,
    ) -> Result<Delegation> {
        let delegation = self
            .store
            .get_delegation(delegation_id)?
            .ok_or_else(|| CircleError::NotFound(format!("delegation {delegation_id}")))?;

        let now = Self::now();
        let resolved = delegation.resolved_status(now);
        if resolved.is_terminal() {
            return Err(CircleError::AlreadyTerminal(resolved));
        }

        let delegator = self
            .store
            .get_membership(&delegation.delegator_membership_id)?
            .ok_or_else(|| {
                CircleError::NotFound(format!(
                    "membership {}",
                    delegation.delegator_membership_id
                ))
            })?;

        if delegator.principal != *acting
            && !self.holds_effective_scope(
                &delegation.circle_id,
                acting,
                Scope::ManageMembers,
                now,
            )?
        {
            return Err(CircleError::InsufficientScope {
                required: Scope::ManageMembers,
                action: "revoke_delegation",
            });
        }

        if !self.store.revoke_delegation(delegation_id, now, acting)? {
            // Lost a race against a concurrent revoke or expiry.
            let current = self
                .store
                .get_delegation(delegation_id)?
                .ok_or_else(|| CircleError::NotFound(format!("delegation {delegation_id}")))?;
            return Err(CircleError::AlreadyTerminal(current.resolved_status(now)));
        }

        info!(delegation = %delegation_id, acting = %acting, "revoked delegation");

        self.store
            .get_delegation(delegation_id)?
            .ok_or_else(|| CircleError::NotFound(format!("delegation {delegation_id}")))
    }

    /// Persists a lazily observed expiry.
    ///
    /// [`Delegation::resolved_status`] already reports expired grants
    /// without touching storage; this makes the transition durable,
    /// exactly once, tolerating concurrent duplicate calls.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyTerminal` if the delegation is already revoked or
    /// expired in storage, `NotFound` if it does not exist.
    pub fn materialize_expiry(&self, delegation_id: &DelegationId) -> Result<Delegation> {
        let delegation = self
            .store
            .get_delegation(delegation_id)?
            .ok_or_else(|| CircleError::NotFound(format!("delegation {delegation_id}")))?;

        if delegation.status.is_terminal() {
            return Err(CircleError::AlreadyTerminal(delegation.status));
        }

        let now = Self::now();
        if delegation.is_active_at(now) {
            // Not due yet; nothing to persist.
            return Ok(delegation);
        }

        if !self.store.expire_delegation(delegation_id, now)? {
            let current = self
                .store
                .get_delegation(delegation_id)?
                .ok_or_else(|| CircleError::NotFound(format!("delegation {delegation_id}")))?;
            return Err(CircleError::AlreadyTerminal(current.resolved_status(now)));
        }

        debug!(delegation = %delegation_id, "materialized delegation expiry");

        self.store
            .get_delegation(delegation_id)?
            .ok_or_else(|| CircleError::NotFound(format!("delegation {delegation_id}")))
    }

    /// Returns the union of scopes delegated to a principal in a circle.
    ///
    /// Computed fresh on every call - never cached - so administrative
    /// mutations are visible immediately. Only delegations whose resolved
    /// status is active contribute.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn active_delegated_scopes(
        &self,
        circle_id: &CircleId,
        delegatee: &Principal,
    ) -> Result<ScopeSet> {
        self.delegated_scopes_at(circle_id, delegatee, Self::now())
    }

    // ==================== Authorization ====================

    /// Decides whether a principal may perform a scoped action.
    ///
    /// Effective scopes are the union of the principal's active membership
    /// role scopes and its active delegated scopes; the requirement is
    /// satisfied when it is in, or implied by, that union. Pure read with
    /// no side effects; identical inputs against unchanged state return
    /// identical results.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the circle does not exist, or a storage
    /// error.
    pub fn authorize(
        &self,
        circle_id: &CircleId,
        principal: &Principal,
        required: Scope,
    ) -> Result<AccessDecision> {
        self.require_circle(circle_id)?;
        let now = Self::now();

        let role_scopes = match self.store.find_active_membership(circle_id, principal)? {
            Some(membership) => self.role_scopes_of(&membership)?,
            None => ScopeSet::new(),
        };
        if self.catalog.satisfies(&role_scopes, required) {
            return Ok(AccessDecision::Allowed {
                via: GrantSource::Role,
            });
        }

        let delegated_scopes = self.delegated_scopes_at(circle_id, principal, now)?;
        if self.catalog.satisfies(&delegated_scopes, required) {
            return Ok(AccessDecision::Allowed {
                via: GrantSource::Delegation,
            });
        }

        let contributed = match (role_scopes.is_empty(), delegated_scopes.is_empty()) {
            (false, false) => ScopeContribution::Both,
            (false, true) => ScopeContribution::Role,
            (true, false) => ScopeContribution::Delegation,
            (true, true) => ScopeContribution::Neither,
        };

        debug!(
            circle = %circle_id,
            principal = %principal,
            required = required.as_str(),
            ?contributed,
            "authorization denied"
        );

        Ok(AccessDecision::Denied {
            required,
            contributed,
        })
    }

    // ==================== Internal Helpers ====================

    fn require_circle(&self, circle_id: &CircleId) -> Result<Circle> {
        self.store
            .get_circle(circle_id)?
            .ok_or_else(|| CircleError::NotFound(format!("circle {circle_id}")))
    }

    fn require_active_circle(&self, circle_id: &CircleId) -> Result<Circle> {
        let circle = self.require_circle(circle_id)?;
        if !circle.status.allows_mutation() {
            return Err(CircleError::CircleArchived(circle_id.to_string()));
        }
        Ok(circle)
    }

    /// Role scopes granted by a membership: the role's set while active,
    /// empty once inactive.
    fn role_scopes_of(&self, membership: &Membership) -> Result<ScopeSet> {
        if !membership.is_active {
            return Ok(ScopeSet::new());
        }
        let role = self
            .store
            .get_role(&membership.role_id)?
            .ok_or_else(|| CircleError::NotFound(format!("role {}", membership.role_id)))?;
        Ok(role.scopes)
    }

    fn delegated_scopes_at(
        &self,
        circle_id: &CircleId,
        delegatee: &Principal,
        now: i64,
    ) -> Result<ScopeSet> {
        let delegations = self.store.delegations_for_delegatee(circle_id, delegatee)?;
        Ok(delegations
            .into_iter()
            .filter(|d| d.is_active_at(now))
            .flat_map(|d| d.scopes)
            .collect())
    }

    fn holds_effective_scope(
        &self,
        circle_id: &CircleId,
        principal: &Principal,
        required: Scope,
        now: i64,
    ) -> Result<bool> {
        let role_scopes = match self.store.find_active_membership(circle_id, principal)? {
            Some(membership) => self.role_scopes_of(&membership)?,
            None => ScopeSet::new(),
        };
        if self.catalog.satisfies(&role_scopes, required) {
            return Ok(true);
        }
        let delegated = self.delegated_scopes_at(circle_id, principal, now)?;
        Ok(self.catalog.satisfies(&delegated, required))
    }

    fn require_effective_scope(
        &self,
        circle_id: &CircleId,
        acting: &Principal,
        required: Scope,
        action: &'static str,
    ) -> Result<()> {
        if self.holds_effective_scope(circle_id, acting, required, Self::now())? {
            Ok(())
        } else {
            Err(CircleError::InsufficientScope { required, action })
        }
    }
}

/// Result of circle creation.
#[derive(Debug, Clone)]
pub struct CircleCreation {
    /// The created circle.
    pub circle: Circle,
    /// The owner role, granting the full scope catalog.
    pub owner_role: Role,
    /// The owner's membership.
    pub owner_membership: Membership,
}
