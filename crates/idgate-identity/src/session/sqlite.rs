//! `SQLite` session store.
//!
//! Shares the identity database pool; the `sessions` and `revocations`
//! tables come from the same migrations.

use async_trait::async_trait;
use idgate_core::db::DatabaseError;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::{RevocationEntry, RevocationReason, RotateOutcome, SessionRecord, SessionStore};
use crate::tenant::Tenant;

const SESSION_COLUMNS: &str = "token_id, family_id, user_id, app_id, issued_at, expires_at";

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_session(
        conn: &mut SqliteConnection,
        tenant: &Tenant,
        record: &SessionRecord,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO sessions (app_id, token_id, family_id, user_id, issued_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT (app_id, token_id) DO NOTHING",
        )
        .bind(tenant.app_id())
        .bind(&record.token_id)
        .bind(&record.family_id)
        .bind(&record.user_id)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert a revocation entry, replacing only an expired one.
    async fn upsert_revocation(
        conn: &mut SqliteConnection,
        tenant: &Tenant,
        entry: &RevocationEntry,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO revocations (app_id, token_id, user_id, family_id, reason, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (app_id, token_id) DO UPDATE SET user_id = excluded.user_id, \
             family_id = excluded.family_id, reason = excluded.reason, expires_at = excluded.expires_at \
             WHERE revocations.expires_at <= ?",
        )
        .bind(tenant.app_id())
        .bind(&entry.token_id)
        .bind(&entry.user_id)
        .bind(&entry.family_id)
        .bind(entry.reason)
        .bind(entry.expires_at)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn live_revocation(
        conn: &mut SqliteConnection,
        tenant: &Tenant,
        token_id: &str,
        now: i64,
    ) -> Result<Option<RevocationEntry>, DatabaseError> {
        let entry = sqlx::query_as::<_, RevocationEntry>(
            "SELECT token_id, app_id, user_id, family_id, reason, expires_at FROM revocations \
             WHERE app_id = ? AND token_id = ? AND expires_at > ?",
        )
        .bind(tenant.app_id())
        .bind(token_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(entry)
    }

    /// Delete the sessions selected by `filter_column = value` and revoke
    /// each of them, in one transaction.
    async fn revoke_matching(
        &self,
        tenant: &Tenant,
        filter_column: &'static str,
        value: &str,
        reason: RevocationReason,
        now: i64,
    ) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query_as::<_, SessionRecord>(&format!(
            "DELETE FROM sessions WHERE app_id = ? AND {filter_column} = ? RETURNING {SESSION_COLUMNS}"
        ))
        .bind(tenant.app_id())
        .bind(value)
        .fetch_all(&mut *tx)
        .await?;

        let mut live = 0;
        for record in &removed {
            let entry = RevocationEntry::for_session(record, reason);
            Self::upsert_revocation(&mut tx, tenant, &entry, now).await?;
            if record.expires_at > now {
                live += 1;
            }
        }

        tx.commit().await?;
        Ok(live)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert(&self, tenant: &Tenant, record: &SessionRecord) -> Result<bool, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_session(&mut conn, tenant, record).await
    }

    async fn get(
        &self,
        tenant: &Tenant,
        token_id: &str,
        now: i64,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE app_id = ? AND token_id = ? AND expires_at > ?"
        ))
        .bind(tenant.app_id())
        .bind(token_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn rotate(
        &self,
        tenant: &Tenant,
        old_token_id: &str,
        successor: &SessionRecord,
        now: i64,
    ) -> Result<RotateOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let previous = sqlx::query_as::<_, SessionRecord>(&format!(
            "DELETE FROM sessions WHERE app_id = ? AND token_id = ? RETURNING {SESSION_COLUMNS}"
        ))
        .bind(tenant.app_id())
        .bind(old_token_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(previous) = previous else {
            let entry = Self::live_revocation(&mut tx, tenant, old_token_id, now).await?;
            tx.rollback().await?;
            return Ok(entry.map_or(RotateOutcome::Missing, RotateOutcome::Revoked));
        };

        if !Self::insert_session(&mut tx, tenant, successor).await? {
            tx.rollback().await?;
            return Err(DatabaseError::Conflict(format!(
                "session {} already exists",
                successor.token_id
            )));
        }

        let rotated = RevocationEntry::for_session(&previous, RevocationReason::Rotated);
        Self::upsert_revocation(&mut tx, tenant, &rotated, now).await?;

        tx.commit().await?;
        Ok(RotateOutcome::Rotated(previous))
    }

    async fn remove(
        &self,
        tenant: &Tenant,
        token_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "DELETE FROM sessions WHERE app_id = ? AND token_id = ? RETURNING {SESSION_COLUMNS}"
        ))
        .bind(tenant.app_id())
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn revoke(
        &self,
        tenant: &Tenant,
        entry: &RevocationEntry,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_revocation(&mut conn, tenant, entry, now).await
    }

    async fn revocation(
        &self,
        tenant: &Tenant,
        token_id: &str,
        now: i64,
    ) -> Result<Option<RevocationEntry>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Self::live_revocation(&mut conn, tenant, token_id, now).await
    }

    async fn revoke_family(
        &self,
        tenant: &Tenant,
        family_id: &str,
        reason: RevocationReason,
        now: i64,
    ) -> Result<u64, DatabaseError> {
        self.revoke_matching(tenant, "family_id", family_id, reason, now).await
    }

    async fn revoke_user(
        &self,
        tenant: &Tenant,
        user_id: &str,
        reason: RevocationReason,
        now: i64,
    ) -> Result<u64, DatabaseError> {
        self.revoke_matching(tenant, "user_id", user_id, reason, now).await
    }

    async fn purge_expired(&self, now: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let revocations = sqlx::query("DELETE FROM revocations WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        debug!(sessions, revocations, "Purged expired session state");
        Ok(sessions + revocations)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Session store closed");
    }
}
