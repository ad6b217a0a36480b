//! Session records and the revocation set.
//!
//! A [`SessionStore`] holds one record per live refresh token and a
//! revocation entry for every token id invalidated before its natural
//! expiry. The store is the only place where rotation is decided, so its
//! [`SessionStore::rotate`] must be atomic per `token_id`.

mod memory;
mod sqlite;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use idgate_core::db::DatabaseError;
use serde::{Deserialize, Serialize};

use crate::tenant::Tenant;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

/// A live refresh-token session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub token_id: String,
    /// Shared by every session descended from the same login.
    pub family_id: String,
    pub user_id: String,
    pub app_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// Why a token id entered the revocation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    Rotated,
    Replay,
    Admin,
}

impl RevocationReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Rotated => "rotated",
            Self::Replay => "replay",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevocationEntry {
    pub token_id: String,
    pub app_id: String,
    pub user_id: String,
    pub family_id: Option<String>,
    pub reason: RevocationReason,
    /// The entry is meaningless after the token itself would have expired.
    pub expires_at: i64,
}

impl RevocationEntry {
    /// Revocation entry for a session, kept until the session would expire.
    pub fn for_session(record: &SessionRecord, reason: RevocationReason) -> Self {
        Self {
            token_id: record.token_id.clone(),
            app_id: record.app_id.clone(),
            user_id: record.user_id.clone(),
            family_id: Some(record.family_id.clone()),
            reason,
            expires_at: record.expires_at,
        }
    }
}

/// Result of [`SessionStore::rotate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The old session was replaced; carries the record that was removed.
    Rotated(SessionRecord),
    /// The token id is in the revocation set.
    Revoked(RevocationEntry),
    /// Neither a live session nor a revocation entry exists.
    Missing,
}

/// Storage for sessions and revocations.
///
/// Every method except [`purge_expired`](Self::purge_expired) and
/// [`close`](Self::close) is scoped to one tenant.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session if no record with the same token id exists.
    async fn insert(&self, tenant: &Tenant, record: &SessionRecord) -> Result<bool, DatabaseError>;

    /// Fetch a live (unexpired) session.
    async fn get(
        &self,
        tenant: &Tenant,
        token_id: &str,
        now: i64,
    ) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Atomically replace `old_token_id` with `successor`: insert the
    /// successor, delete the old record and mark it `rotated`. At most one
    /// caller per `old_token_id` sees [`RotateOutcome::Rotated`].
    async fn rotate(
        &self,
        tenant: &Tenant,
        old_token_id: &str,
        successor: &SessionRecord,
        now: i64,
    ) -> Result<RotateOutcome, DatabaseError>;

    /// Delete a session, returning it if it existed.
    async fn remove(
        &self,
        tenant: &Tenant,
        token_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Add a revocation entry unless a live one exists for the token id.
    async fn revoke(
        &self,
        tenant: &Tenant,
        entry: &RevocationEntry,
        now: i64,
    ) -> Result<bool, DatabaseError>;

    /// Look up a revocation entry. Expired entries are reported as absent.
    async fn revocation(
        &self,
        tenant: &Tenant,
        token_id: &str,
        now: i64,
    ) -> Result<Option<RevocationEntry>, DatabaseError>;

    /// Delete and revoke every live session of a family.
    async fn revoke_family(
        &self,
        tenant: &Tenant,
        family_id: &str,
        reason: RevocationReason,
        now: i64,
    ) -> Result<u64, DatabaseError>;

    /// Delete and revoke every live session of a user.
    async fn revoke_user(
        &self,
        tenant: &Tenant,
        user_id: &str,
        reason: RevocationReason,
        now: i64,
    ) -> Result<u64, DatabaseError>;

    /// Drop expired sessions and revocation entries in all tenants.
    async fn purge_expired(&self, now: i64) -> Result<u64, DatabaseError>;

    /// Release the store. Later calls fail.
    async fn close(&self);
}
