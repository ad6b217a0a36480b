//! Local accounts: registration, password login and deactivation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use super::tokens::{TokenPair, TokenService};
use crate::auth::PasswordHasher;
use crate::deadline::with_deadline;
use crate::error::{IdentityError, Result};
use crate::storage::{IdentityStore, NewUser, Profile, User, normalize_email};
use crate::tenant::Tenant;

pub const MIN_PASSWORD_CHARS: usize = 8;

/// Result of a password login.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    Authenticated(TokenPair),
    /// The password was right but a second factor is outstanding. The
    /// pending token goes to `TwoFactorEngine::login_verify`.
    SecondFactorRequired { pending_token: String },
}

pub struct AccountService {
    store: Arc<dyn IdentityStore>,
    hasher: Arc<dyn PasswordHasher>,
    tokens: Arc<TokenService>,
    deadline: Duration,
    /// Verified against when the email is unknown, so both paths cost a hash.
    dummy_hash: String,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        hasher: Arc<dyn PasswordHasher>,
        tokens: Arc<TokenService>,
        deadline: Duration,
    ) -> Result<Self> {
        let dummy_hash = hasher
            .hash("idgate-dummy-password")
            .map_err(|e| IdentityError::internal("password hashing", e))?;
        Ok(Self {
            store,
            hasher,
            tokens,
            deadline,
            dummy_hash,
        })
    }

    #[instrument(skip(self, tenant, email, password, profile), fields(app_id = tenant.app_id()))]
    pub async fn register(
        &self,
        tenant: &Tenant,
        email: &str,
        password: &str,
        profile: Profile,
    ) -> Result<User> {
        let email = validate_email(email)?;
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(IdentityError::InvalidInput(
                "password must be at least 8 characters",
            ));
        }

        let password_hash = self
            .hasher
            .hash(password)
            .map_err(|e| IdentityError::internal("password hashing", e))?;
        let new_user = NewUser {
            email,
            password_hash: Some(password_hash),
            email_verified: false,
            profile,
        };

        let user = with_deadline(
            self.deadline,
            "create_user",
            self.store.create_user(tenant, &new_user),
        )
        .await?;

        info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    /// Check a password. Unknown email, wrong password, an account without
    /// a password and a deactivated account all fail the same way.
    #[instrument(skip(self, tenant, email, password), fields(app_id = tenant.app_id()))]
    pub async fn login(
        &self,
        tenant: &Tenant,
        email: &str,
        password: &str,
    ) -> Result<LoginOutcome> {
        let user = with_deadline(
            self.deadline,
            "find_user_by_email",
            self.store.find_user_by_email(tenant, email),
        )
        .await?;

        let hash = user.as_ref().and_then(|u| u.password_hash.as_deref());
        let valid = self
            .hasher
            .verify(password, hash.unwrap_or(&self.dummy_hash))
            .map_err(|e| IdentityError::internal("password verification", e))?
            && hash.is_some();

        let user = match user {
            Some(user) if valid && user.active => user,
            _ => {
                warn!("Failed login attempt");
                return Err(IdentityError::Authentication);
            }
        };

        if user.two_factor_enabled {
            let pending_token = self.tokens.issue_pending(tenant, &user.id)?;
            info!(user_id = %user.id, "Password accepted, second factor required");
            return Ok(LoginOutcome::SecondFactorRequired { pending_token });
        }

        let pair = self.tokens.issue_pair(tenant, &user.id).await?;
        info!(user_id = %user.id, "User logged in");
        Ok(LoginOutcome::Authenticated(pair))
    }

    /// Block the user and end all of their refresh sessions. Returns the
    /// number of sessions revoked. Issued access tokens run out on their own.
    #[instrument(skip(self, tenant), fields(app_id = tenant.app_id()))]
    pub async fn deactivate(&self, tenant: &Tenant, user_id: &str) -> Result<u64> {
        let found = with_deadline(
            self.deadline,
            "set_active",
            self.store.set_active(tenant, user_id, false),
        )
        .await?;
        if !found {
            return Err(IdentityError::InvalidInput("unknown user"));
        }

        let revoked = self.tokens.revoke_all(tenant, user_id).await?;
        info!(user_id, revoked, "User deactivated");
        Ok(revoked)
    }
}

fn validate_email(email: &str) -> Result<String> {
    let email = normalize_email(email);
    let valid = email.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty()
            && !domain.contains('@')
            && domain.contains('.')
            && !domain.starts_with('.')
            && !domain.ends_with('.')
    }) && !email.chars().any(char::is_whitespace);

    if valid {
        Ok(email)
    } else {
        Err(IdentityError::InvalidInput("invalid email address"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shapes() {
        assert_eq!(
            validate_email(" Bob@Example.org ").ok().as_deref(),
            Some("bob@example.org")
        );
        for bad in ["", "bob", "@example.org", "bob@", "bob@example", "bob@.org", "b ob@x.org"] {
            assert!(validate_email(bad).is_err(), "{bad:?}");
        }
        assert!(validate_email("a@b@c.org").is_err());
    }
}
