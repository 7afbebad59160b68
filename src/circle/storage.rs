//! `SQLite` storage for the circle engine.
//!
//! This module provides persistent storage for circles, roles,
//! memberships, and delegations. Scope sets are stored as JSON text
//! columns; statuses and principals as their string representations.
//!
//! # Concurrency
//!
//! Every guarded transition (archive, revoke, expire, deactivate) is a
//! conditional `UPDATE` whose `WHERE` clause encodes the expected current
//! state. The affected-row count tells the caller whether it won the
//! race; the loser sees zero rows and nothing is changed. Compound
//! mutations run inside a single transaction.

// SQLite operations need to hold the lock for the duration of the operation.
// Dropping the guard earlier would require restructuring all methods.
#![allow(clippy::significant_drop_tightening)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::error::{CircleError, Result};
use super::store::CircleStore;
use super::types::{
    Circle, CircleId, CircleStatus, Delegation, DelegationId, DelegationStatus, Membership,
    MembershipId, Principal, Role, RoleId, RoleLevel,
};
use crate::scope::ScopeSet;

/// `SQLite`-based storage for circle data.
///
/// Thread-safe wrapper around a `SQLite` connection. The connection mutex
/// serializes writers within a process; cross-instance safety comes from
/// the conditional updates and unique indexes in the schema.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Creates a new storage instance at the given path.
    ///
    /// Creates the database file and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or initialized.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// Creates an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// Acquires the connection lock.
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CircleError::Storage(format!("Failed to acquire database lock: {e}")))
    }

    /// Initializes the database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r"
            -- Circle metadata
            CREATE TABLE IF NOT EXISTS circles (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'active',
                created_at INTEGER NOT NULL
            );

            -- Per-circle roles (scope bundles)
            CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                circle_id TEXT NOT NULL REFERENCES circles(id),
                name TEXT NOT NULL,
                level TEXT NOT NULL,
                scopes TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            );

            -- Exactly one owner role per circle
            CREATE UNIQUE INDEX IF NOT EXISTS idx_roles_owner
                ON roles(circle_id) WHERE level = 'owner';

            -- Principal-to-circle bindings; inactive rows are history
            CREATE TABLE IF NOT EXISTS memberships (
                id TEXT PRIMARY KEY,
                circle_id TEXT NOT NULL REFERENCES circles(id),
                principal TEXT NOT NULL,
                role_id TEXT NOT NULL REFERENCES roles(id),
                is_active INTEGER NOT NULL DEFAULT 1,
                joined_at INTEGER NOT NULL,
                left_at INTEGER
            );

            -- At most one active membership per principal per circle
            CREATE UNIQUE INDEX IF NOT EXISTS idx_memberships_active_principal
                ON memberships(circle_id, principal) WHERE is_active = 1;

            -- Scope grants; terminal rows are immutable history
            CREATE TABLE IF NOT EXISTS delegations (
                id TEXT PRIMARY KEY,
                circle_id TEXT NOT NULL REFERENCES circles(id),
                delegator_membership_id TEXT NOT NULL REFERENCES memberships(id),
                delegatee TEXT NOT NULL,
                scopes TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                revoked_at INTEGER,
                revoked_by TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_delegations_delegatee
                ON delegations(circle_id, delegatee);
            CREATE INDEX IF NOT EXISTS idx_delegations_delegator
                ON delegations(delegator_membership_id);
            ",
        )?;

        Ok(())
    }

    // ==================== Row Conversions ====================

    fn encode_scopes(scopes: &ScopeSet) -> Result<String> {
        serde_json::to_string(scopes)
            .map_err(|e| CircleError::Storage(format!("Failed to serialize scopes: {e}")))
    }

    fn decode_scopes(json: &str) -> Result<ScopeSet> {
        serde_json::from_str(json)
            .map_err(|e| CircleError::InvalidData(format!("Invalid scopes JSON: {e}")))
    }

    fn decode_principal(key: &str) -> Result<Principal> {
        Principal::parse_key(key)
            .ok_or_else(|| CircleError::InvalidData(format!("Invalid principal key: {key}")))
    }

    /// Returns whether an insert failed on a uniqueness constraint.
    fn is_constraint_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }

    #[allow(clippy::type_complexity)]
    fn circle_from_parts(
        (id, display_name, slug, status_str, created_at): (String, String, String, String, i64),
    ) -> Result<Circle> {
        let status = CircleStatus::parse(&status_str)
            .ok_or_else(|| CircleError::InvalidData(format!("Invalid status: {status_str}")))?;
        Ok(Circle {
            id: CircleId::from(id.as_str()),
            display_name,
            slug,
            status,
            created_at,
        })
    }

    #[allow(clippy::type_complexity)]
    fn role_from_parts(
        (id, circle_id, name, level_str, scopes_json, created_at): (
            String,
            String,
            String,
            String,
            String,
            i64,
        ),
    ) -> Result<Role> {
        let level = RoleLevel::parse(&level_str)
            .ok_or_else(|| CircleError::InvalidData(format!("Invalid role level: {level_str}")))?;
        Ok(Role {
            id: RoleId::from(id.as_str()),
            circle_id: CircleId::from(circle_id.as_str()),
            name,
            level,
            scopes: Self::decode_scopes(&scopes_json)?,
            created_at,
        })
    }

    #[allow(clippy::type_complexity)]
    fn membership_from_parts(
        (id, circle_id, principal_key, role_id, is_active, joined_at, left_at): (
            String,
            String,
            String,
            String,
            i64,
            i64,
            Option<i64>,
        ),
    ) -> Result<Membership> {
        Ok(Membership {
            id: MembershipId::from(id.as_str()),
            circle_id: CircleId::from(circle_id.as_str()),
            principal: Self::decode_principal(&principal_key)?,
            role_id: RoleId::from(role_id.as_str()),
            is_active: is_active != 0,
            joined_at,
            left_at,
        })
    }

    #[allow(clippy::type_complexity)]
    fn delegation_from_parts(
        (id, circle_id, delegator, delegatee_key, scopes_json, status_str, expires_at): (
            String,
            String,
            String,
            String,
            String,
            String,
            Option<i64>,
        ),
        (created_at, revoked_at, revoked_by_key): (i64, Option<i64>, Option<String>),
    ) -> Result<Delegation> {
        let status = DelegationStatus::parse(&status_str)
            .ok_or_else(|| CircleError::InvalidData(format!("Invalid status: {status_str}")))?;
        let revoked_by = revoked_by_key
            .as_deref()
            .map(Self::decode_principal)
            .transpose()?;
        Ok(Delegation {
            id: DelegationId::from(id.as_str()),
            circle_id: CircleId::from(circle_id.as_str()),
            delegator_membership_id: MembershipId::from(delegator.as_str()),
            delegatee: Self::decode_principal(&delegatee_key)?,
            scopes: Self::decode_scopes(&scopes_json)?,
            status,
            expires_at,
            created_at,
            revoked_at,
            revoked_by,
        })
    }

    fn insert_role_tx(tx: &rusqlite::Transaction<'_>, role: &Role) -> Result<()> {
        let scopes_json = Self::encode_scopes(&role.scopes)?;
        tx.execute(
            r"
            INSERT INTO roles (id, circle_id, name, level, scopes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                role.id.as_str(),
                role.circle_id.as_str(),
                &role.name,
                role.level.as_str(),
                &scopes_json,
                role.created_at,
            ],
        )
        .map_err(|e| {
            if Self::is_constraint_violation(&e) {
                CircleError::DuplicateRoleLevelOwner
            } else {
                CircleError::Database(e)
            }
        })?;
        Ok(())
    }

    fn insert_membership_tx(tx: &rusqlite::Transaction<'_>, membership: &Membership) -> Result<()> {
        tx.execute(
            r"
            INSERT INTO memberships (id, circle_id, principal, role_id, is_active, joined_at, left_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                membership.id.as_str(),
                membership.circle_id.as_str(),
                membership.principal.storage_key(),
                membership.role_id.as_str(),
                i32::from(membership.is_active),
                membership.joined_at,
                membership.left_at,
            ],
        )
        .map_err(|e| {
            if Self::is_constraint_violation(&e) {
                CircleError::DuplicatePrincipal(membership.principal.storage_key())
            } else {
                CircleError::Database(e)
            }
        })?;
        Ok(())
    }
}

impl CircleStore for SqliteStore {
    // ==================== Circles ====================

    fn create_circle_with_owner(
        &self,
        circle: &Circle,
        owner_role: &Role,
        owner_membership: &Membership,
    ) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r"
            INSERT INTO circles (id, display_name, slug, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                circle.id.as_str(),
                &circle.display_name,
                &circle.slug,
                circle.status.as_str(),
                circle.created_at,
            ],
        )
        .map_err(|e| {
            if Self::is_constraint_violation(&e) {
                CircleError::AlreadyExists(circle.slug.clone())
            } else {
                CircleError::Database(e)
            }
        })?;

        Self::insert_role_tx(&tx, owner_role)?;
        Self::insert_membership_tx(&tx, owner_membership)?;

        tx.commit()?;
        Ok(())
    }

    fn get_circle(&self, id: &CircleId) -> Result<Option<Circle>> {
        let conn = self.lock_conn()?;

        let result = conn
            .query_row(
                r"
                SELECT id, display_name, slug, status, created_at
                FROM circles
                WHERE id = ?1
                ",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        result.map(Self::circle_from_parts).transpose()
    }

    fn archive_circle(&self, id: &CircleId, expected: CircleStatus) -> Result<bool> {
        let conn = self.lock_conn()?;

        let rows = conn.execute(
            r"
            UPDATE circles
            SET status = 'archived'
            WHERE id = ?1 AND status = ?2
            ",
            params![id.as_str(), expected.as_str()],
        )?;

        Ok(rows > 0)
    }

    // ==================== Roles ====================

    fn insert_role(&self, role: &Role) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        Self::insert_role_tx(&tx, role)?;
        tx.commit()?;
        Ok(())
    }

    fn get_role(&self, id: &RoleId) -> Result<Option<Role>> {
        let conn = self.lock_conn()?;

        let result = conn
            .query_row(
                r"
                SELECT id, circle_id, name, level, scopes, created_at
                FROM roles
                WHERE id = ?1
                ",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        result.map(Self::role_from_parts).transpose()
    }

    fn owner_role(&self, circle_id: &CircleId) -> Result<Option<Role>> {
        let conn = self.lock_conn()?;

        let result = conn
            .query_row(
                r"
                SELECT id, circle_id, name, level, scopes, created_at
                FROM roles
                WHERE circle_id = ?1 AND level = 'owner'
                ",
                params![circle_id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        result.map(Self::role_from_parts).transpose()
    }

    fn update_role_scopes(&self, id: &RoleId, scopes: &ScopeSet) -> Result<bool> {
        let conn = self.lock_conn()?;
        let scopes_json = Self::encode_scopes(scopes)?;

        let rows = conn.execute(
            "UPDATE roles SET scopes = ?1 WHERE id = ?2",
            params![&scopes_json, id.as_str()],
        )?;

        Ok(rows > 0)
    }

    // ==================== Memberships ====================

    fn insert_membership(&self, membership: &Membership) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        Self::insert_membership_tx(&tx, membership)?;
        tx.commit()?;
        Ok(())
    }

    fn get_membership(&self, id: &MembershipId) -> Result<Option<Membership>> {
        let conn = self.lock_conn()?;

        let result = conn
            .query_row(
                r"
                SELECT id, circle_id, principal, role_id, is_active, joined_at, left_at
                FROM memberships
                WHERE id = ?1
                ",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        result.map(Self::membership_from_parts).transpose()
    }

    fn find_active_membership(
        &self,
        circle_id: &CircleId,
        principal: &Principal,
    ) -> Result<Option<Membership>> {
        let conn = self.lock_conn()?;

        let result = conn
            .query_row(
                r"
                SELECT id, circle_id, principal, role_id, is_active, joined_at, left_at
                FROM memberships
                WHERE circle_id = ?1 AND principal = ?2 AND is_active = 1
                ",
                params![circle_id.as_str(), principal.storage_key()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;

        result.map(Self::membership_from_parts).transpose()
    }

    fn update_membership_role(&self, id: &MembershipId, new_role: &RoleId) -> Result<bool> {
        let conn = self.lock_conn()?;

        let rows = conn.execute(
            r"
            UPDATE memberships
            SET role_id = ?1
            WHERE id = ?2 AND is_active = 1
            ",
            params![new_role.as_str(), id.as_str()],
        )?;

        Ok(rows > 0)
    }

    fn deactivate_membership(
        &self,
        id: &MembershipId,
        left_at: i64,
        revoked_by: &Principal,
    ) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let rows = tx.execute(
            r"
            UPDATE memberships
            SET is_active = 0, left_at = ?1
            WHERE id = ?2 AND is_active = 1
            ",
            params![left_at, id.as_str()],
        )?;

        if rows == 0 {
            return Ok(false);
        }

        // Cascade: revoke (not delete) everything this membership granted.
        // Already-lapsed grants are left for lazy expiry.
        tx.execute(
            r"
            UPDATE delegations
            SET status = 'revoked', revoked_at = ?1, revoked_by = ?2
            WHERE delegator_membership_id = ?3
              AND status = 'active'
              AND (expires_at IS NULL OR expires_at > ?1)
            ",
            params![left_at, revoked_by.storage_key(), id.as_str()],
        )?;

        tx.commit()?;
        Ok(true)
    }

    // ==================== Delegations ====================

    fn insert_delegation(&self, delegation: &Delegation) -> Result<()> {
        let conn = self.lock_conn()?;
        let scopes_json = Self::encode_scopes(&delegation.scopes)?;

        conn.execute(
            r"
            INSERT INTO delegations
                (id, circle_id, delegator_membership_id, delegatee, scopes, status,
                 expires_at, created_at, revoked_at, revoked_by)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                delegation.id.as_str(),
                delegation.circle_id.as_str(),
                delegation.delegator_membership_id.as_str(),
                delegation.delegatee.storage_key(),
                &scopes_json,
                delegation.status.as_str(),
                delegation.expires_at,
                delegation.created_at,
                delegation.revoked_at,
                delegation.revoked_by.as_ref().map(Principal::storage_key),
            ],
        )?;

        Ok(())
    }

    fn get_delegation(&self, id: &DelegationId) -> Result<Option<Delegation>> {
        let conn = self.lock_conn()?;

        let result = conn
            .query_row(
                r"
                SELECT id, circle_id, delegator_membership_id, delegatee, scopes, status,
                       expires_at, created_at, revoked_at, revoked_by
                FROM delegations
                WHERE id = ?1
                ",
                params![id.as_str()],
                |row| {
                    Ok((
                        (
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ),
                        (row.get(7)?, row.get(8)?, row.get(9)?),
                    ))
                },
            )
            .optional()?;

        result
            .map(|(head, tail)| Self::delegation_from_parts(head, tail))
            .transpose()
    }

    fn delegations_for_delegatee(
        &self,
        circle_id: &CircleId,
        delegatee: &Principal,
    ) -> Result<Vec<Delegation>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            r"
            SELECT id, circle_id, delegator_membership_id, delegatee, scopes, status,
                   expires_at, created_at, revoked_at, revoked_by
            FROM delegations
            WHERE circle_id = ?1 AND delegatee = ?2
            ORDER BY created_at
            ",
        )?;

        let rows = stmt
            .query_map(
                params![circle_id.as_str(), delegatee.storage_key()],
                |row| {
                    Ok((
                        (
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ),
                        (row.get(7)?, row.get(8)?, row.get(9)?),
                    ))
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(head, tail)| Self::delegation_from_parts(head, tail))
            .collect()
    }

    fn revoke_delegation(
        &self,
        id: &DelegationId,
        now: i64,
        revoked_by: &Principal,
    ) -> Result<bool> {
        let conn = self.lock_conn()?;

        // Guard on stored status AND wall clock: a grant past its expiry
        // must surface as expired, never as freshly revoked.
        let rows = conn.execute(
            r"
            UPDATE delegations
            SET status = 'revoked', revoked_at = ?1, revoked_by = ?2
            WHERE id = ?3
              AND status = 'active'
              AND (expires_at IS NULL OR expires_at > ?1)
            ",
            params![now, revoked_by.storage_key(), id.as_str()],
        )?;

        Ok(rows > 0)
    }

    fn expire_delegation(&self, id: &DelegationId, now: i64) -> Result<bool> {
        let conn = self.lock_conn()?;

        let rows = conn.execute(
            r"
            UPDATE delegations
            SET status = 'expired'
            WHERE id = ?1
              AND status = 'active'
              AND expires_at IS NOT NULL
              AND expires_at <= ?2
            ",
            params![id.as_str(), now],
        )?;

        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    fn test_circle(n: u8) -> Circle {
        Circle {
            id: CircleId::from(format!("circle-{n}").as_str()),
            display_name: format!("Circle {n}"),
            slug: format!("circle-{n}"),
            status: CircleStatus::Active,
            created_at: 1_000,
        }
    }

    fn owner_role_for(circle: &Circle) -> Role {
        Role {
            id: RoleId::from(format!("{}-owner", circle.id).as_str()),
            circle_id: circle.id.clone(),
            name: "Owner".to_string(),
            level: RoleLevel::Owner,
            scopes: Scope::ALL.into_iter().collect(),
            created_at: 1_000,
        }
    }

    fn owner_membership_for(circle: &Circle, role: &Role, principal: &Principal) -> Membership {
        Membership {
            id: MembershipId::from(format!("{}-m0", circle.id).as_str()),
            circle_id: circle.id.clone(),
            principal: principal.clone(),
            role_id: role.id.clone(),
            is_active: true,
            joined_at: 1_000,
            left_at: None,
        }
    }

    fn seed_circle(store: &SqliteStore, n: u8, owner: &Principal) -> (Circle, Role, Membership) {
        let circle = test_circle(n);
        let role = owner_role_for(&circle);
        let membership = owner_membership_for(&circle, &role, owner);
        store
            .create_circle_with_owner(&circle, &role, &membership)
            .unwrap();
        (circle, role, membership)
    }

    fn test_delegation(
        circle: &Circle,
        delegator: &Membership,
        delegatee: &Principal,
        n: u8,
        expires_at: Option<i64>,
    ) -> Delegation {
        Delegation {
            id: DelegationId::from(format!("{}-d{n}", circle.id).as_str()),
            circle_id: circle.id.clone(),
            delegator_membership_id: delegator.id.clone(),
            delegatee: delegatee.clone(),
            scopes: ScopeSet::from([Scope::View]),
            status: DelegationStatus::Active,
            expires_at,
            created_at: 1_000,
            revoked_at: None,
            revoked_by: None,
        }
    }

    // ==================== Circle Tests ====================

    #[test]
    fn create_and_get_circle_with_owner() {
        let store = store();
        let owner = Principal::individual("olive");
        let (circle, role, membership) = seed_circle(&store, 1, &owner);

        let retrieved = store.get_circle(&circle.id).unwrap().unwrap();
        assert_eq!(retrieved, circle);

        let owner_role = store.owner_role(&circle.id).unwrap().unwrap();
        assert_eq!(owner_role, role);

        let found = store.find_active_membership(&circle.id, &owner).unwrap();
        assert_eq!(found, Some(membership));
    }

    #[test]
    fn get_nonexistent_circle_returns_none() {
        let store = store();
        assert!(store.get_circle(&CircleId::from("missing")).unwrap().is_none());
    }

    #[test]
    fn duplicate_slug_fails_with_already_exists() {
        let store = store();
        let owner = Principal::individual("olive");
        seed_circle(&store, 1, &owner);

        let mut dup = test_circle(2);
        dup.slug = "circle-1".to_string();
        let role = owner_role_for(&dup);
        let membership = owner_membership_for(&dup, &role, &owner);

        let err = store
            .create_circle_with_owner(&dup, &role, &membership)
            .unwrap_err();
        assert!(matches!(err, CircleError::AlreadyExists(slug) if slug == "circle-1"));

        // Nothing from the failed transaction may remain.
        assert!(store.get_circle(&dup.id).unwrap().is_none());
        assert!(store.owner_role(&dup.id).unwrap().is_none());
    }

    #[test]
    fn archive_circle_is_conditional_on_expected_status() {
        let store = store();
        let owner = Principal::individual("olive");
        let (circle, _, _) = seed_circle(&store, 1, &owner);

        assert!(store.archive_circle(&circle.id, CircleStatus::Active).unwrap());
        let archived = store.get_circle(&circle.id).unwrap().unwrap();
        assert_eq!(archived.status, CircleStatus::Archived);

        // Second attempt loses the guard.
        assert!(!store.archive_circle(&circle.id, CircleStatus::Active).unwrap());
    }

    // ==================== Role Tests ====================

    #[test]
    fn second_owner_role_is_rejected() {
        let store = store();
        let owner = Principal::individual("olive");
        let (circle, _, _) = seed_circle(&store, 1, &owner);

        let mut extra = owner_role_for(&circle);
        extra.id = RoleId::from("another-owner");
        let err = store.insert_role(&extra).unwrap_err();
        assert!(matches!(err, CircleError::DuplicateRoleLevelOwner));
    }

    #[test]
    fn insert_and_update_role_scopes() {
        let store = store();
        let owner = Principal::individual("olive");
        let (circle, _, _) = seed_circle(&store, 1, &owner);

        let role = Role {
            id: RoleId::from("helper"),
            circle_id: circle.id.clone(),
            name: "Helper".to_string(),
            level: RoleLevel::Member,
            scopes: ScopeSet::from([Scope::View]),
            created_at: 1_100,
        };
        store.insert_role(&role).unwrap();

        let wider = ScopeSet::from([Scope::View, Scope::SendMessages]);
        assert!(store.update_role_scopes(&role.id, &wider).unwrap());

        let retrieved = store.get_role(&role.id).unwrap().unwrap();
        assert_eq!(retrieved.scopes, wider);

        assert!(!store
            .update_role_scopes(&RoleId::from("missing"), &wider)
            .unwrap());
    }

    // ==================== Membership Tests ====================

    #[test]
    fn duplicate_active_principal_is_rejected() {
        let store = store();
        let owner = Principal::individual("olive");
        let (circle, role, _) = seed_circle(&store, 1, &owner);

        let again = Membership {
            id: MembershipId::from("m-dup"),
            circle_id: circle.id.clone(),
            principal: owner.clone(),
            role_id: role.id.clone(),
            is_active: true,
            joined_at: 2_000,
            left_at: None,
        };
        let err = store.insert_membership(&again).unwrap_err();
        assert!(matches!(err, CircleError::DuplicatePrincipal(_)));
    }

    #[test]
    fn rejoining_after_deactivation_is_allowed() {
        let store = store();
        let owner = Principal::individual("olive");
        let member = Principal::individual("mina");
        let (circle, role, _) = seed_circle(&store, 1, &owner);

        let first = Membership {
            id: MembershipId::from("m1"),
            circle_id: circle.id.clone(),
            principal: member.clone(),
            role_id: role.id.clone(),
            is_active: true,
            joined_at: 2_000,
            left_at: None,
        };
        store.insert_membership(&first).unwrap();
        assert!(store
            .deactivate_membership(&first.id, 3_000, &owner)
            .unwrap());

        // History row keeps the old id; a fresh active row is permitted.
        let second = Membership {
            id: MembershipId::from("m2"),
            joined_at: 4_000,
            ..first.clone()
        };
        store.insert_membership(&second).unwrap();

        let active = store
            .find_active_membership(&circle.id, &member)
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);

        let history = store.get_membership(&first.id).unwrap().unwrap();
        assert!(!history.is_active);
        assert_eq!(history.left_at, Some(3_000));
    }

    #[test]
    fn update_membership_role_requires_active_row() {
        let store = store();
        let owner = Principal::individual("olive");
        let (circle, role, membership) = seed_circle(&store, 1, &owner);

        let other = Role {
            id: RoleId::from("helper"),
            circle_id: circle.id.clone(),
            name: "Helper".to_string(),
            level: RoleLevel::Member,
            scopes: ScopeSet::from([Scope::View]),
            created_at: 1_100,
        };
        store.insert_role(&other).unwrap();

        assert!(store
            .update_membership_role(&membership.id, &other.id)
            .unwrap());
        assert!(store
            .deactivate_membership(&membership.id, 2_000, &owner)
            .unwrap());
        assert!(!store
            .update_membership_role(&membership.id, &role.id)
            .unwrap());
    }

    #[test]
    fn deactivate_membership_revokes_granted_delegations() {
        let store = store();
        let owner = Principal::individual("olive");
        let grace = Principal::individual("grace");
        let (circle, _, membership) = seed_circle(&store, 1, &owner);

        let open_ended = test_delegation(&circle, &membership, &grace, 1, None);
        let lapsed = test_delegation(&circle, &membership, &grace, 2, Some(1_500));
        store.insert_delegation(&open_ended).unwrap();
        store.insert_delegation(&lapsed).unwrap();

        assert!(store
            .deactivate_membership(&membership.id, 2_000, &owner)
            .unwrap());

        let revoked = store.get_delegation(&open_ended.id).unwrap().unwrap();
        assert_eq!(revoked.status, DelegationStatus::Revoked);
        assert_eq!(revoked.revoked_at, Some(2_000));
        assert_eq!(revoked.revoked_by, Some(owner.clone()));

        // The already-lapsed grant is left for lazy expiry, not revoked.
        let lapsed_row = store.get_delegation(&lapsed.id).unwrap().unwrap();
        assert_eq!(lapsed_row.status, DelegationStatus::Active);
        assert_eq!(lapsed_row.resolved_status(2_000), DelegationStatus::Expired);

        // Second deactivation loses the guard.
        assert!(!store
            .deactivate_membership(&membership.id, 2_500, &owner)
            .unwrap());
    }

    // ==================== Delegation Tests ====================

    #[test]
    fn save_and_get_delegation() {
        let store = store();
        let owner = Principal::individual("olive");
        let org = Principal::organization("acme");
        let (circle, _, membership) = seed_circle(&store, 1, &owner);

        let delegation = test_delegation(&circle, &membership, &org, 1, Some(9_000));
        store.insert_delegation(&delegation).unwrap();

        let retrieved = store.get_delegation(&delegation.id).unwrap().unwrap();
        assert_eq!(retrieved, delegation);

        let for_org = store
            .delegations_for_delegatee(&circle.id, &org)
            .unwrap();
        assert_eq!(for_org, vec![delegation]);
    }

    #[test]
    fn revoke_delegation_wins_once() {
        let store = store();
        let owner = Principal::individual("olive");
        let grace = Principal::individual("grace");
        let (circle, _, membership) = seed_circle(&store, 1, &owner);

        let delegation = test_delegation(&circle, &membership, &grace, 1, None);
        store.insert_delegation(&delegation).unwrap();

        assert!(store.revoke_delegation(&delegation.id, 2_000, &owner).unwrap());
        let revoked = store.get_delegation(&delegation.id).unwrap().unwrap();
        assert_eq!(revoked.status, DelegationStatus::Revoked);
        assert_eq!(revoked.revoked_at, Some(2_000));

        // The loser of the race changes nothing.
        assert!(!store.revoke_delegation(&delegation.id, 3_000, &grace).unwrap());
        let unchanged = store.get_delegation(&delegation.id).unwrap().unwrap();
        assert_eq!(unchanged.revoked_at, Some(2_000));
        assert_eq!(unchanged.revoked_by, Some(owner));
    }

    #[test]
    fn revoke_respects_lapsed_expiry() {
        let store = store();
        let owner = Principal::individual("olive");
        let grace = Principal::individual("grace");
        let (circle, _, membership) = seed_circle(&store, 1, &owner);

        let delegation = test_delegation(&circle, &membership, &grace, 1, Some(1_500));
        store.insert_delegation(&delegation).unwrap();

        // Past the expiry instant the revoke guard must not match.
        assert!(!store.revoke_delegation(&delegation.id, 2_000, &owner).unwrap());
        assert!(store.expire_delegation(&delegation.id, 2_000).unwrap());

        let expired = store.get_delegation(&delegation.id).unwrap().unwrap();
        assert_eq!(expired.status, DelegationStatus::Expired);
        assert_eq!(expired.revoked_at, None);
    }

    #[test]
    fn expire_delegation_guards() {
        let store = store();
        let owner = Principal::individual("olive");
        let grace = Principal::individual("grace");
        let (circle, _, membership) = seed_circle(&store, 1, &owner);

        let open_ended = test_delegation(&circle, &membership, &grace, 1, None);
        let bounded = test_delegation(&circle, &membership, &grace, 2, Some(5_000));
        store.insert_delegation(&open_ended).unwrap();
        store.insert_delegation(&bounded).unwrap();

        // No expiry set, or not yet due: guard does not match.
        assert!(!store.expire_delegation(&open_ended.id, 9_000).unwrap());
        assert!(!store.expire_delegation(&bounded.id, 4_999).unwrap());

        // Due: exactly one transition.
        assert!(store.expire_delegation(&bounded.id, 5_000).unwrap());
        assert!(!store.expire_delegation(&bounded.id, 6_000).unwrap());
    }
}
