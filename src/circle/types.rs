//! Core types for circle membership and delegation.
//!
//! This module defines the data structures for circles (federated groups
//! with roles and memberships), principals (individuals or organizations),
//! and delegations (time-bounded scope grants between principals).
//!
//! # Trust Model
//!
//! Permissions layer as circle → member → role → delegation. A principal's
//! effective scopes are the union of its active membership's role scopes
//! and the scopes of active delegations pointed at it. Delegation is not
//! transitive: delegated scopes can never be re-delegated.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scope::{Scope, ScopeSet};

/// Generates a random 128-bit identifier as lowercase hex.
fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Unique identifier for a circle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircleId(String);

impl CircleId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CircleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a role.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleId(String);

impl RoleId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a membership.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MembershipId(String);

impl MembershipId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MembershipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MembershipId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a delegation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DelegationId(String);

impl DelegationId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DelegationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An identity capable of holding membership or receiving delegation.
///
/// Exactly one of the two kinds - never both. Modeled as a tagged variant
/// so membership and delegation lookups stay a single discriminated key
/// comparison ([`Principal::storage_key`]).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Principal {
    /// An individual identity.
    Individual(String),
    /// An organization identity.
    Organization(String),
}

impl Principal {
    /// Creates an individual principal.
    #[must_use]
    pub fn individual(id: impl Into<String>) -> Self {
        Self::Individual(id.into())
    }

    /// Creates an organization principal.
    #[must_use]
    pub fn organization(id: impl Into<String>) -> Self {
        Self::Organization(id.into())
    }

    /// Returns the identity portion.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Individual(id) | Self::Organization(id) => id,
        }
    }

    /// Returns the kind discriminant for storage.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Individual(_) => "individual",
            Self::Organization(_) => "organization",
        }
    }

    /// Returns the single discriminated storage key, e.g. `individual:ada`.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind(), self.id())
    }

    /// Parses a storage key produced by [`Principal::storage_key`].
    #[must_use]
    pub fn parse_key(s: &str) -> Option<Self> {
        let (kind, id) = s.split_once(':')?;
        if id.is_empty() {
            return None;
        }
        match kind {
            "individual" => Some(Self::Individual(id.to_string())),
            "organization" => Some(Self::Organization(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Lifecycle status of a circle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleStatus {
    /// Open for all operations.
    #[default]
    Active,
    /// Temporarily closed; mutations are frozen.
    Inactive,
    /// Permanently closed; mutations are frozen, history is preserved.
    Archived,
}

impl CircleStatus {
    /// Converts to string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Returns whether mutations are permitted in this status.
    #[must_use]
    pub const fn allows_mutation(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// A federated group scoping memberships, roles, and delegations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    /// Unique identifier.
    pub id: CircleId,
    /// User-facing display name.
    pub display_name: String,
    /// URL-safe identifier, unique across circles, immutable once created.
    pub slug: String,
    /// Lifecycle status.
    pub status: CircleStatus,
    /// When the circle was created (Unix timestamp).
    pub created_at: i64,
}

/// Trust level of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleLevel {
    /// The singular circle owner. Created with the circle, immutable.
    Owner,
    /// Administrative roles.
    Admin,
    /// Regular member roles.
    Member,
}

impl RoleLevel {
    /// Converts to string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    /// Returns whether this is the owner level.
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        matches!(self, Self::Owner)
    }
}

/// A named, circle-scoped bundle of scopes with a trust level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Unique identifier.
    pub id: RoleId,
    /// The circle this role belongs to.
    pub circle_id: CircleId,
    /// Role name (e.g. "Helper").
    pub name: String,
    /// Trust level.
    pub level: RoleLevel,
    /// Scopes granted by this role.
    pub scopes: ScopeSet,
    /// When the role was created (Unix timestamp).
    pub created_at: i64,
}

/// The binding of a principal to a circle via a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Unique identifier.
    pub id: MembershipId,
    /// The circle this membership belongs to.
    pub circle_id: CircleId,
    /// The bound principal.
    pub principal: Principal,
    /// The role held by the principal.
    pub role_id: RoleId,
    /// Whether the membership is currently active.
    pub is_active: bool,
    /// When the principal joined (Unix timestamp).
    pub joined_at: i64,
    /// When the membership was deactivated, if it was (Unix timestamp).
    pub left_at: Option<i64>,
}

/// Status of a delegation.
///
/// `Revoked` and `Expired` are terminal: those records are immutable
/// history and are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    /// The grant is in force.
    Active,
    /// Explicitly revoked by the delegator, an admin, or the owner.
    Revoked,
    /// Lapsed because wall-clock time passed `expires_at`.
    Expired,
}

impl DelegationStatus {
    /// Converts to string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Returns whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Revoked | Self::Expired)
    }
}

/// A time-bounded, scope-limited grant from a member to a principal.
///
/// The delegatee may or may not hold its own membership in the circle.
/// `scopes` was validated as a subset of the delegator's effective role
/// scopes at creation time and is not re-validated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Unique identifier.
    pub id: DelegationId,
    /// The circle this delegation belongs to.
    pub circle_id: CircleId,
    /// The membership that granted the scopes.
    pub delegator_membership_id: MembershipId,
    /// The principal receiving the scopes.
    pub delegatee: Principal,
    /// The granted scopes.
    pub scopes: ScopeSet,
    /// Stored status. Read through [`Delegation::resolved_status`].
    pub status: DelegationStatus,
    /// Automatic expiry (Unix timestamp). `None` means no automatic
    /// expiry; the delegation must be revoked explicitly.
    pub expires_at: Option<i64>,
    /// When the delegation was created (Unix timestamp).
    pub created_at: i64,
    /// When the delegation was revoked, if it was (Unix timestamp).
    pub revoked_at: Option<i64>,
    /// Who revoked the delegation, if anyone.
    pub revoked_by: Option<Principal>,
}

impl Delegation {
    /// Resolves the status at a point in time.
    ///
    /// Expiry is evaluated lazily: a stored `Active` status with a past
    /// `expires_at` reads as `Expired` without mutating storage. Callers
    /// needing a durable transition use the delegation engine's expiry
    /// materialization.
    #[must_use]
    pub const fn resolved_status(&self, now: i64) -> DelegationStatus {
        match self.status {
            DelegationStatus::Active => match self.expires_at {
                Some(at) => {
                    if at <= now {
                        DelegationStatus::Expired
                    } else {
                        DelegationStatus::Active
                    }
                }
                None => DelegationStatus::Active,
            },
            terminal => terminal,
        }
    }

    /// Returns whether the delegation grants its scopes at `now`.
    #[must_use]
    pub const fn is_active_at(&self, now: i64) -> bool {
        matches!(self.resolved_status(now), DelegationStatus::Active)
    }
}

/// Which grant source satisfied an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    /// The principal's membership role satisfied the requirement.
    Role,
    /// An active inbound delegation satisfied the requirement.
    Delegation,
}

/// Which sources contributed scopes to a denied evaluation.
///
/// Recorded on denials so audit trails can show how close a principal was
/// to the required scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeContribution {
    /// Only the membership role contributed scopes.
    Role,
    /// Only active delegations contributed scopes.
    Delegation,
    /// Both sources contributed scopes.
    Both,
    /// The principal holds no scopes in the circle.
    Neither,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessDecision {
    /// The required scope is held or implied.
    Allowed {
        /// The source that satisfied the requirement. When both role and
        /// delegation would satisfy it, the role is reported.
        via: GrantSource,
    },
    /// The required scope is neither held nor implied.
    Denied {
        /// The scope that was required.
        required: Scope,
        /// Which sources contributed any scopes at all.
        contributed: ScopeContribution,
    },
}

impl AccessDecision {
    /// Returns whether the decision permits the action.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Derives a circle slug from a display name.
///
/// Lowercases the name and collapses every non-alphanumeric run into a
/// single hyphen. Slugs are unique per store and immutable once created.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_hex_and_unique() {
        let a = CircleId::generate();
        let b = CircleId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn principal_storage_key_roundtrip() {
        let ada = Principal::individual("ada");
        let acme = Principal::organization("acme");

        assert_eq!(ada.storage_key(), "individual:ada");
        assert_eq!(acme.storage_key(), "organization:acme");
        assert_eq!(Principal::parse_key(&ada.storage_key()), Some(ada));
        assert_eq!(Principal::parse_key(&acme.storage_key()), Some(acme));
    }

    #[test]
    fn principal_parse_key_rejects_malformed_input() {
        assert_eq!(Principal::parse_key("ada"), None);
        assert_eq!(Principal::parse_key("individual:"), None);
        assert_eq!(Principal::parse_key("robot:r2d2"), None);
    }

    #[test]
    fn principal_kinds_are_distinct_keys() {
        // Same id, different kind - must never collide in lookups.
        let person = Principal::individual("ada");
        let org = Principal::organization("ada");
        assert_ne!(person.storage_key(), org.storage_key());
    }

    #[test]
    fn circle_status_as_str_parse() {
        for status in [
            CircleStatus::Active,
            CircleStatus::Inactive,
            CircleStatus::Archived,
        ] {
            assert_eq!(CircleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CircleStatus::parse("deleted"), None);
    }

    #[test]
    fn only_active_circles_allow_mutation() {
        assert!(CircleStatus::Active.allows_mutation());
        assert!(!CircleStatus::Inactive.allows_mutation());
        assert!(!CircleStatus::Archived.allows_mutation());
    }

    #[test]
    fn role_level_as_str_parse() {
        for level in [RoleLevel::Owner, RoleLevel::Admin, RoleLevel::Member] {
            assert_eq!(RoleLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(RoleLevel::parse("superuser"), None);
        assert!(RoleLevel::Owner.is_owner());
        assert!(!RoleLevel::Admin.is_owner());
    }

    #[test]
    fn delegation_status_terminality() {
        assert!(!DelegationStatus::Active.is_terminal());
        assert!(DelegationStatus::Revoked.is_terminal());
        assert!(DelegationStatus::Expired.is_terminal());
    }

    fn test_delegation(status: DelegationStatus, expires_at: Option<i64>) -> Delegation {
        Delegation {
            id: DelegationId::from("d1"),
            circle_id: CircleId::from("c1"),
            delegator_membership_id: MembershipId::from("m1"),
            delegatee: Principal::individual("grace"),
            scopes: ScopeSet::from([Scope::View]),
            status,
            expires_at,
            created_at: 1_000,
            revoked_at: None,
            revoked_by: None,
        }
    }

    #[test]
    fn resolved_status_active_without_expiry_stays_active() {
        let d = test_delegation(DelegationStatus::Active, None);
        assert_eq!(d.resolved_status(i64::MAX), DelegationStatus::Active);
        assert!(d.is_active_at(i64::MAX));
    }

    #[test]
    fn resolved_status_lazily_expires() {
        let d = test_delegation(DelegationStatus::Active, Some(2_000));
        assert_eq!(d.resolved_status(1_999), DelegationStatus::Active);
        // Boundary: expired exactly at the expiry instant.
        assert_eq!(d.resolved_status(2_000), DelegationStatus::Expired);
        assert_eq!(d.resolved_status(3_000), DelegationStatus::Expired);
    }

    #[test]
    fn resolved_status_terminal_states_are_sticky() {
        let revoked = test_delegation(DelegationStatus::Revoked, Some(2_000));
        assert_eq!(revoked.resolved_status(1), DelegationStatus::Revoked);

        let expired = test_delegation(DelegationStatus::Expired, None);
        assert_eq!(expired.resolved_status(1), DelegationStatus::Expired);
    }

    #[test]
    fn access_decision_is_allowed() {
        let allow = AccessDecision::Allowed {
            via: GrantSource::Role,
        };
        let deny = AccessDecision::Denied {
            required: Scope::ManageMembers,
            contributed: ScopeContribution::Neither,
        };
        assert!(allow.is_allowed());
        assert!(!deny.is_allowed());
    }

    #[test]
    fn slugify_basic() {
        assert_eq!(slugify("Garden Crew"), "garden-crew");
        assert_eq!(slugify("  Mutual Aid / North  "), "mutual-aid-north");
        assert_eq!(slugify("Circle #1"), "circle-1");
    }

    #[test]
    fn slugify_collapses_runs_and_trims_edges() {
        assert_eq!(slugify("--a---b--"), "a-b");
        assert_eq!(slugify("???"), "");
    }
}
