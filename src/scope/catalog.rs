//! The scope catalog and its implication relation.
//!
//! The catalog is the single authority on which scopes exist and which
//! scopes imply which others. It is global, versioned, and immutable at
//! runtime: implications are declared as direct edges below and closed
//! reflexively and transitively when the catalog is built.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use thiserror::Error;

use super::types::{Scope, ScopeSet};

/// Current catalog version.
///
/// Bumped whenever a scope is added or an implication edge changes.
pub const CATALOG_VERSION: u32 = 1;

/// Direct implication edges: holding the left scope grants the right ones.
const DIRECT_IMPLICATIONS: &[(Scope, &[Scope])] = &[
    (Scope::SendMessages, &[Scope::View]),
    (Scope::ModeratePosts, &[Scope::View]),
    (Scope::ManageMembers, &[Scope::View]),
    (Scope::ManageRoles, &[Scope::View]),
    (
        Scope::ManageCircle,
        &[Scope::ManageMembers, Scope::ManageRoles, Scope::ModeratePosts],
    ),
];

/// Error type for scope catalog lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    /// A scope identifier outside the catalog was referenced.
    ///
    /// This is a configuration error: the caller and the catalog disagree
    /// about which capabilities exist. Always fatal to the triggering
    /// request, never retried.
    #[error("Unknown scope: {0}")]
    UnknownScope(String),
}

/// The versioned catalog of grantable scopes.
///
/// Answers implication queries against the precomputed closure. Obtain the
/// process-wide instance with [`ScopeCatalog::global`].
#[derive(Debug)]
pub struct ScopeCatalog {
    version: u32,
    // scope -> every scope it grants, including itself
    closure: BTreeMap<Scope, ScopeSet>,
}

impl ScopeCatalog {
    fn build() -> Self {
        let mut closure: BTreeMap<Scope, ScopeSet> = Scope::ALL
            .into_iter()
            .map(|s| (s, ScopeSet::from([s])))
            .collect();

        for &(holder, granted) in DIRECT_IMPLICATIONS {
            closure
                .get_mut(&holder)
                .expect("catalog edge references a listed scope")
                .extend(granted.iter().copied());
        }

        // Close transitively: propagate until a full pass adds nothing.
        loop {
            let mut changed = false;
            for holder in Scope::ALL {
                let reachable: ScopeSet = closure[&holder]
                    .iter()
                    .flat_map(|granted| closure[granted].iter().copied())
                    .collect();
                let entry = closure.get_mut(&holder).expect("scope present");
                if reachable.len() > entry.len() {
                    *entry = reachable;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        Self {
            version: CATALOG_VERSION,
            closure,
        }
    }

    /// Returns the process-wide catalog, building it on first use.
    #[must_use]
    pub fn global() -> &'static Self {
        static CATALOG: OnceLock<ScopeCatalog> = OnceLock::new();
        CATALOG.get_or_init(Self::build)
    }

    /// Returns the catalog version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Returns every scope in the catalog, in catalog order.
    #[must_use]
    pub fn scopes(&self) -> ScopeSet {
        self.closure.keys().copied().collect()
    }

    /// Returns whether holding `holder` grants `target`.
    ///
    /// Reflexive: every scope implies itself.
    #[must_use]
    pub fn implies(&self, holder: Scope, target: Scope) -> bool {
        self.closure[&holder].contains(&target)
    }

    /// Returns the implication closure of a held scope set.
    #[must_use]
    pub fn closure(&self, held: &ScopeSet) -> ScopeSet {
        held.iter()
            .flat_map(|s| self.closure[s].iter().copied())
            .collect()
    }

    /// Returns whether a held scope set satisfies a required scope.
    ///
    /// A requirement is satisfied if some held scope equals or implies it.
    #[must_use]
    pub fn satisfies(&self, held: &ScopeSet, required: Scope) -> bool {
        held.iter().any(|&h| self.implies(h, required))
    }

    /// Returns the requested scopes not satisfied by the held set.
    #[must_use]
    pub fn unsatisfied(&self, held: &ScopeSet, requested: &ScopeSet) -> ScopeSet {
        requested
            .iter()
            .copied()
            .filter(|&r| !self.satisfies(held, r))
            .collect()
    }

    /// Resolves a scope identifier at the string boundary.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownScope`] if the identifier is not in the
    /// catalog.
    pub fn resolve(&self, name: &str) -> Result<Scope, ScopeError> {
        Scope::parse(name).ok_or_else(|| ScopeError::UnknownScope(name.to_string()))
    }

    /// Resolves a list of scope identifiers into a scope set.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::UnknownScope`] on the first identifier not in
    /// the catalog.
    pub fn resolve_set<I, S>(&self, names: I) -> Result<ScopeSet, ScopeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| self.resolve(name.as_ref()))
            .collect()
    }
}
