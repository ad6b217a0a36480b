//! Social account queries.

use async_trait::async_trait;
use idgate_core::db::DatabaseError;

use super::db::IdentityDatabase;
use super::models::{NewSocialAccount, NewUser, ProviderSnapshot, SocialAccount, User};
use super::repository::SocialAccountRepository;
use crate::tenant::Tenant;

impl IdentityDatabase {
    async fn insert_social_account(
        conn: &mut sqlx::SqliteConnection,
        tenant: &Tenant,
        user_id: &str,
        account: &NewSocialAccount,
        now: i64,
    ) -> Result<SocialAccount, DatabaseError> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO social_accounts \
             (id, app_id, user_id, provider, provider_user_id, email, name, locale, avatar_url, access_token, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant.app_id())
        .bind(user_id)
        .bind(&account.provider)
        .bind(&account.provider_user_id)
        .bind(&account.snapshot.email)
        .bind(&account.snapshot.name)
        .bind(&account.snapshot.locale)
        .bind(&account.snapshot.avatar_url)
        .bind(&account.access_token)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query_as::<_, SocialAccount>("SELECT * FROM social_accounts WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl SocialAccountRepository for IdentityDatabase {
    async fn find_social_account(
        &self,
        tenant: &Tenant,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<SocialAccount>, DatabaseError> {
        let account = sqlx::query_as::<_, SocialAccount>(
            "SELECT * FROM social_accounts WHERE provider = ? AND provider_user_id = ? AND app_id = ?",
        )
        .bind(provider)
        .bind(provider_user_id)
        .bind(tenant.app_id())
        .fetch_optional(self.pool())
        .await?;

        Ok(account)
    }

    async fn list_social_accounts(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<Vec<SocialAccount>, DatabaseError> {
        let accounts = sqlx::query_as::<_, SocialAccount>(
            "SELECT * FROM social_accounts WHERE user_id = ? AND app_id = ? ORDER BY created_at, provider",
        )
        .bind(user_id)
        .bind(tenant.app_id())
        .fetch_all(self.pool())
        .await?;

        Ok(accounts)
    }

    async fn create_social_account(
        &self,
        tenant: &Tenant,
        user_id: &str,
        account: &NewSocialAccount,
    ) -> Result<SocialAccount, DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        Self::insert_social_account(&mut conn, tenant, user_id, account, self.now()).await
    }

    async fn create_user_with_social(
        &self,
        tenant: &Tenant,
        user: &NewUser,
        account: &NewSocialAccount,
    ) -> Result<(User, SocialAccount), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let now = self.now();
        let user = Self::insert_user(&mut tx, tenant, user, now).await?;
        let account = Self::insert_social_account(&mut tx, tenant, &user.id, account, now).await?;

        tx.commit().await?;
        Ok((user, account))
    }

    async fn update_social_account(
        &self,
        tenant: &Tenant,
        id: &str,
        snapshot: &ProviderSnapshot,
        access_token: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE social_accounts SET email = ?, name = ?, locale = ?, avatar_url = ?, \
             access_token = COALESCE(?, access_token), updated_at = ? WHERE id = ? AND app_id = ?",
        )
        .bind(&snapshot.email)
        .bind(&snapshot.name)
        .bind(&snapshot.locale)
        .bind(&snapshot.avatar_url)
        .bind(access_token)
        .bind(self.now())
        .bind(id)
        .bind(tenant.app_id())
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
