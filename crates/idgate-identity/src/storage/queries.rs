//! Application and user queries.

use async_trait::async_trait;
use idgate_core::db::DatabaseError;

use super::db::IdentityDatabase;
use super::models::{Application, NewUser, Profile, User, normalize_email};
use super::repository::{ApplicationRepository, UserRepository};
use crate::tenant::Tenant;

impl IdentityDatabase {
    /// Insert a user inside an open transaction.
    pub(super) async fn insert_user(
        conn: &mut sqlx::SqliteConnection,
        tenant: &Tenant,
        user: &NewUser,
        now: i64,
    ) -> Result<User, DatabaseError> {
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO users (id, app_id, email, password_hash, email_verified, name, locale, avatar_url, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant.app_id())
        .bind(normalize_email(&user.email))
        .bind(&user.password_hash)
        .bind(user.email_verified)
        .bind(&user.profile.name)
        .bind(&user.profile.locale)
        .bind(&user.profile.avatar_url)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl ApplicationRepository for IdentityDatabase {
    async fn create_application(
        &self,
        slug: &str,
        name: &str,
    ) -> Result<Application, DatabaseError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = self.now();

        sqlx::query("INSERT INTO applications (id, slug, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(slug)
            .bind(name)
            .bind(now)
            .execute(self.pool())
            .await?;

        self.find_application(&id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Application {id}")))
    }

    async fn find_application(
        &self,
        identifier: &str,
    ) -> Result<Option<Application>, DatabaseError> {
        // An id match wins over a slug that happens to equal some id.
        let app = sqlx::query_as::<_, Application>(
            "SELECT * FROM applications WHERE id = ? OR slug = ? ORDER BY id = ? DESC LIMIT 1",
        )
        .bind(identifier)
        .bind(identifier)
        .bind(identifier)
        .fetch_optional(self.pool())
        .await?;

        Ok(app)
    }
}

#[async_trait]
impl UserRepository for IdentityDatabase {
    async fn create_user(&self, tenant: &Tenant, user: &NewUser) -> Result<User, DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        Self::insert_user(&mut conn, tenant, user, self.now()).await
    }

    async fn get_user(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ? AND app_id = ?")
            .bind(user_id)
            .bind(tenant.app_id())
            .fetch_optional(self.pool())
            .await?;

        Ok(user)
    }

    async fn find_user_by_email(
        &self,
        tenant: &Tenant,
        email: &str,
    ) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ? AND app_id = ?")
            .bind(normalize_email(email))
            .bind(tenant.app_id())
            .fetch_optional(self.pool())
            .await?;

        Ok(user)
    }

    async fn update_profile(
        &self,
        tenant: &Tenant,
        user_id: &str,
        profile: &Profile,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE users SET name = ?, locale = ?, avatar_url = ?, updated_at = ? WHERE id = ? AND app_id = ?",
        )
        .bind(&profile.name)
        .bind(&profile.locale)
        .bind(&profile.avatar_url)
        .bind(self.now())
        .bind(user_id)
        .bind(tenant.app_id())
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("User {user_id}")));
        }
        Ok(())
    }

    async fn mark_email_verified(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE users SET email_verified = 1, updated_at = ? WHERE id = ? AND app_id = ?",
        )
        .bind(self.now())
        .bind(user_id)
        .bind(tenant.app_id())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn set_active(
        &self,
        tenant: &Tenant,
        user_id: &str,
        active: bool,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE users SET active = ?, updated_at = ? WHERE id = ? AND app_id = ?")
                .bind(active)
                .bind(self.now())
                .bind(user_id)
                .bind(tenant.app_id())
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }
}
