//! Scope identifiers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// An atomic grantable capability within a circle.
///
/// Scopes are the unit of permission in the engine: roles bundle them,
/// delegations carry subsets of them, and the authorization evaluator
/// checks them. The set of scopes is closed - new capabilities require a
/// new catalog version.
///
/// Variant order is the catalog order and is stable across releases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Read circle content and member lists.
    View,
    /// Post messages to the circle.
    SendMessages,
    /// Moderate the circle's post board (hide, pin, close posts).
    ModeratePosts,
    /// Add and remove members, change member roles.
    ManageMembers,
    /// Create non-owner roles and edit their scope sets.
    ManageRoles,
    /// Circle lifecycle control (archive) and everything it implies.
    ManageCircle,
}

/// An ordered set of scopes.
pub type ScopeSet = BTreeSet<Scope>;

impl Scope {
    /// All scopes, in catalog order.
    pub const ALL: [Self; 6] = [
        Self::View,
        Self::SendMessages,
        Self::ModeratePosts,
        Self::ManageMembers,
        Self::ManageRoles,
        Self::ManageCircle,
    ];

    /// Converts to string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::SendMessages => "send_messages",
            Self::ModeratePosts => "moderate_posts",
            Self::ManageMembers => "manage_members",
            Self::ManageRoles => "manage_roles",
            Self::ManageCircle => "manage_circle",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "view" => Some(Self::View),
            "send_messages" => Some(Self::SendMessages),
            "moderate_posts" => Some(Self::ModeratePosts),
            "manage_members" => Some(Self::ManageMembers),
            "manage_roles" => Some(Self::ManageRoles),
            "manage_circle" => Some(Self::ManageCircle),
            _ => None,
        }
    }
}

/// Formats a scope set as a comma-separated list of identifiers.
///
/// Used in error messages and log events.
#[must_use]
pub fn format_scopes(scopes: &ScopeSet) -> String {
    scopes
        .iter()
        .map(Scope::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
