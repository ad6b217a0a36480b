//! Persistence interfaces consumed by the identity services.
//!
//! Every tenant-owned lookup takes a [`Tenant`]; there is no way to express
//! a cross-tenant query through these traits.

use async_trait::async_trait;

use idgate_core::db::DatabaseError;

use super::models::{
    Application, ChallengeOutcome, NewSocialAccount, NewUser, Profile, ProviderSnapshot,
    SecondFactorChallenge, SecondFactorProof, SocialAccount, User,
};
use crate::tenant::Tenant;

#[async_trait]
pub trait ApplicationRepository: Send + Sync {
    async fn create_application(
        &self,
        slug: &str,
        name: &str,
    ) -> Result<Application, DatabaseError>;

    /// Look up an application by id or slug.
    async fn find_application(
        &self,
        identifier: &str,
    ) -> Result<Option<Application>, DatabaseError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with `DatabaseError::Conflict` if the email exists in the tenant.
    async fn create_user(&self, tenant: &Tenant, user: &NewUser) -> Result<User, DatabaseError>;

    async fn get_user(&self, tenant: &Tenant, user_id: &str) -> Result<Option<User>, DatabaseError>;

    async fn find_user_by_email(
        &self,
        tenant: &Tenant,
        email: &str,
    ) -> Result<Option<User>, DatabaseError>;

    async fn update_profile(
        &self,
        tenant: &Tenant,
        user_id: &str,
        profile: &Profile,
    ) -> Result<(), DatabaseError>;

    async fn mark_email_verified(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn set_active(
        &self,
        tenant: &Tenant,
        user_id: &str,
        active: bool,
    ) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait SocialAccountRepository: Send + Sync {
    async fn find_social_account(
        &self,
        tenant: &Tenant,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<SocialAccount>, DatabaseError>;

    async fn list_social_accounts(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<Vec<SocialAccount>, DatabaseError>;

    /// Link a provider identity to an existing user.
    async fn create_social_account(
        &self,
        tenant: &Tenant,
        user_id: &str,
        account: &NewSocialAccount,
    ) -> Result<SocialAccount, DatabaseError>;

    /// Create a user and its first social account atomically.
    async fn create_user_with_social(
        &self,
        tenant: &Tenant,
        user: &NewUser,
        account: &NewSocialAccount,
    ) -> Result<(User, SocialAccount), DatabaseError>;

    async fn update_social_account(
        &self,
        tenant: &Tenant,
        id: &str,
        snapshot: &ProviderSnapshot,
        access_token: Option<&str>,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait SecondFactorRepository: Send + Sync {
    /// Store (or replace) the unconfirmed secret for a user.
    async fn put_pending_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        secret: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError>;

    /// Remove the pending secret and return it if it had not expired.
    async fn take_pending_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        now: i64,
    ) -> Result<Option<String>, DatabaseError>;

    async fn has_pending_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        now: i64,
    ) -> Result<bool, DatabaseError>;

    /// Persist a confirmed secret on a user that does not have 2FA enabled.
    async fn confirm_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
        secret: &str,
    ) -> Result<bool, DatabaseError>;

    /// Turn 2FA on and replace the recovery codes in one transaction.
    /// `false` if the user has no confirmed secret or is already enabled.
    async fn enable_two_factor(
        &self,
        tenant: &Tenant,
        user_id: &str,
        code_hashes: &[String],
    ) -> Result<bool, DatabaseError>;

    /// Clear secret, last step and recovery codes.
    async fn disable_two_factor(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Record `step` as used; `false` if it is not newer than the last one.
    async fn advance_totp_step(
        &self,
        tenant: &Tenant,
        user_id: &str,
        step: i64,
    ) -> Result<bool, DatabaseError>;

    /// Mark a recovery code consumed; `false` if unknown or already used.
    async fn consume_recovery_code(
        &self,
        tenant: &Tenant,
        user_id: &str,
        code_hash: &str,
        now: i64,
    ) -> Result<bool, DatabaseError>;

    /// Redeem a pending login and spend its proof in one transaction. On
    /// anything but `Completed` neither is changed.
    async fn complete_second_factor(
        &self,
        tenant: &Tenant,
        challenge: SecondFactorChallenge<'_>,
        proof: &SecondFactorProof,
        now: i64,
    ) -> Result<ChallengeOutcome, DatabaseError>;

    /// Forget redeemed pending logins whose tokens have expired.
    async fn purge_completed_challenges(&self, now: i64) -> Result<u64, DatabaseError>;

    async fn count_unused_recovery_codes(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<i64, DatabaseError>;
}

/// Everything the identity services need from persistence.
pub trait IdentityStore:
    ApplicationRepository + UserRepository + SocialAccountRepository + SecondFactorRepository
{
}

impl<T> IdentityStore for T where
    T: ApplicationRepository + UserRepository + SocialAccountRepository + SecondFactorRepository
{
}
