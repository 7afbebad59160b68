//! The scope catalog - grantable capabilities and their implications.
//!
//! A scope is an atomic capability (for example `view` or
//! `manage_members`). The catalog is a fixed, versioned enumeration of all
//! scopes with a partial order: some scopes imply others, so granting
//! `manage_circle` also grants everything circle management needs.
//!
//! The catalog is loaded once per process ([`ScopeCatalog::global`]) and is
//! read-only at runtime. Referencing a scope identifier outside the catalog
//! is a configuration error ([`ScopeError::UnknownScope`]), fatal to the
//! triggering request.
//!
//! # Types
//!
//! - [`Scope`]: a single grantable capability
//! - [`ScopeSet`]: an ordered set of scopes
//! - [`ScopeCatalog`]: implication queries and string-boundary resolution

mod catalog;
pub mod types;

pub use catalog::{ScopeCatalog, ScopeError, CATALOG_VERSION};
pub use types::{format_scopes, Scope, ScopeSet};
