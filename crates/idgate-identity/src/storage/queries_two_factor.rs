//! Second-factor queries: pending secrets, confirmed secrets, recovery codes.

use async_trait::async_trait;
use idgate_core::db::DatabaseError;

use super::db::IdentityDatabase;
use super::models::{ChallengeOutcome, SecondFactorChallenge, SecondFactorProof};
use super::repository::SecondFactorRepository;
use crate::tenant::Tenant;

impl IdentityDatabase {
    async fn spend_totp_step(
        conn: &mut sqlx::SqliteConnection,
        tenant: &Tenant,
        user_id: &str,
        step: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE users SET totp_last_step = ? \
             WHERE id = ? AND app_id = ? AND (totp_last_step IS NULL OR totp_last_step < ?)",
        )
        .bind(step)
        .bind(user_id)
        .bind(tenant.app_id())
        .bind(step)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn spend_recovery_code(
        conn: &mut sqlx::SqliteConnection,
        tenant: &Tenant,
        user_id: &str,
        code_hash: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE recovery_codes SET consumed_at = ? \
             WHERE app_id = ? AND user_id = ? AND code_hash = ? AND consumed_at IS NULL",
        )
        .bind(now)
        .bind(tenant.app_id())
        .bind(user_id)
        .bind(code_hash)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SecondFactorRepository for IdentityDatabase {
    async fn put_pending_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        secret: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO pending_totp_secrets (app_id, user_id, secret, expires_at, created_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (app_id, user_id) DO UPDATE SET secret = excluded.secret, expires_at = excluded.expires_at, created_at = excluded.created_at",
        )
        .bind(tenant.app_id())
        .bind(user_id)
        .bind(secret)
        .bind(expires_at)
        .bind(self.now())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn take_pending_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        now: i64,
    ) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "DELETE FROM pending_totp_secrets WHERE app_id = ? AND user_id = ? RETURNING secret, expires_at",
        )
        .bind(tenant.app_id())
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.and_then(|(secret, expires_at)| (expires_at > now).then_some(secret)))
    }

    async fn has_pending_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pending_totp_secrets WHERE app_id = ? AND user_id = ? AND expires_at > ?",
        )
        .bind(tenant.app_id())
        .bind(user_id)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(row.0 > 0)
    }

    async fn confirm_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        secret: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE users SET totp_secret = ?, totp_last_step = NULL, updated_at = ? \
             WHERE id = ? AND app_id = ? AND two_factor_enabled = 0",
        )
        .bind(secret)
        .bind(self.now())
        .bind(user_id)
        .bind(tenant.app_id())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn enable_two_factor(
        &self,
        tenant: &Tenant,
        user_id: &str,
        code_hashes: &[String],
    ) -> Result<bool, DatabaseError> {
        let now = self.now();
        let mut tx = self.pool().begin().await?;

        let enabled = sqlx::query(
            "UPDATE users SET two_factor_enabled = 1, updated_at = ? \
             WHERE id = ? AND app_id = ? AND two_factor_enabled = 0 AND totp_secret IS NOT NULL",
        )
        .bind(now)
        .bind(user_id)
        .bind(tenant.app_id())
        .execute(&mut *tx)
        .await?;

        if enabled.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM recovery_codes WHERE app_id = ? AND user_id = ?")
            .bind(tenant.app_id())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        for hash in code_hashes {
            sqlx::query(
                "INSERT INTO recovery_codes (id, app_id, user_id, code_hash, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(tenant.app_id())
            .bind(user_id)
            .bind(hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn disable_two_factor(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE users SET two_factor_enabled = 0, totp_secret = NULL, totp_last_step = NULL, updated_at = ? \
             WHERE id = ? AND app_id = ?",
        )
        .bind(self.now())
        .bind(user_id)
        .bind(tenant.app_id())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM recovery_codes WHERE app_id = ? AND user_id = ?")
            .bind(tenant.app_id())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM pending_totp_secrets WHERE app_id = ? AND user_id = ?")
            .bind(tenant.app_id())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_totp_step(
        &self,
        tenant: &Tenant,
        user_id: &str,
        step: i64,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        Self::spend_totp_step(&mut conn, tenant, user_id, step).await
    }

    async fn consume_recovery_code(
        &self,
        tenant: &Tenant,
        user_id: &str,
        code_hash: &str,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        Self::spend_recovery_code(&mut conn, tenant, user_id, code_hash, now).await
    }

    async fn complete_second_factor(
        &self,
        tenant: &Tenant,
        challenge: SecondFactorChallenge<'_>,
        proof: &SecondFactorProof,
        now: i64,
    ) -> Result<ChallengeOutcome, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        // Claim the pending token first: the loser of a race stops here.
        let claimed = sqlx::query(
            "INSERT INTO second_factor_challenges (app_id, token_id, user_id, expires_at, completed_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT (app_id, token_id) DO NOTHING",
        )
        .bind(tenant.app_id())
        .bind(challenge.token_id)
        .bind(challenge.user_id)
        .bind(challenge.expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ChallengeOutcome::AlreadyCompleted);
        }

        let spent = match proof {
            SecondFactorProof::TotpStep(step) => {
                Self::spend_totp_step(&mut tx, tenant, challenge.user_id, *step).await?
            }
            SecondFactorProof::RecoveryCode(hash) => {
                Self::spend_recovery_code(&mut tx, tenant, challenge.user_id, hash, now).await?
            }
        };
        if !spent {
            tx.rollback().await?;
            return Ok(ChallengeOutcome::ProofRejected);
        }

        tx.commit().await?;
        Ok(ChallengeOutcome::Completed)
    }

    async fn purge_completed_challenges(&self, now: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM second_factor_challenges WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }

    async fn count_unused_recovery_codes(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM recovery_codes WHERE app_id = ? AND user_id = ? AND consumed_at IS NULL",
        )
        .bind(tenant.app_id())
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;

        Ok(row.0)
    }
}
