//! Resolve third-party identities into first-party accounts.
//!
//! Resolution order for a provider profile:
//! 1. an existing social account for `(provider, provider_user_id)` in the
//!    tenant, whose user gets a non-destructive profile sync;
//! 2. an existing user with the same email, which gets the account linked;
//! 3. a new user created together with its social account.
//!
//! Two first logins racing on the same identity both end on the same social
//! account: the loser hits a unique key and resolves again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use idgate_core::config::Config;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::tokens::{TokenPair, TokenService};
use crate::deadline::with_deadline;
use crate::error::{IdentityError, Result, SocialProviderError};
use crate::social::{OAuthProviderClient, ProviderProfile, SocialProvider};
use crate::storage::{
    IdentityStore, NewSocialAccount, NewUser, Profile, ProviderSnapshot, SocialAccount, User,
};
use crate::tenant::Tenant;

/// Attempts before a persistent unique-key conflict is reported.
const RESOLVE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SocialSettings {
    pub provider_timeout: Duration,
    pub store_deadline: Duration,
}

impl SocialSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            provider_timeout: Duration::from_secs(config.social.provider_timeout_secs),
            store_deadline: Duration::from_millis(config.storage.store_deadline_ms),
        }
    }
}

impl Default for SocialSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A completed social login.
#[derive(Debug, Clone, Serialize)]
pub struct SocialLogin {
    pub user: User,
    pub is_new_account: bool,
    pub tokens: TokenPair,
}

pub struct SocialIdentityResolver {
    store: Arc<dyn IdentityStore>,
    tokens: Arc<TokenService>,
    providers: HashMap<String, Arc<dyn SocialProvider>>,
    settings: SocialSettings,
}

impl SocialIdentityResolver {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        tokens: Arc<TokenService>,
        settings: SocialSettings,
    ) -> Self {
        Self {
            store,
            tokens,
            providers: HashMap::new(),
            settings,
        }
    }

    /// Build a resolver with an OAuth client for every configured provider.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn IdentityStore>,
        tokens: Arc<TokenService>,
    ) -> Result<Self> {
        let settings = SocialSettings::from_config(config);
        let mut resolver = Self::new(store, tokens, settings);
        for (name, provider) in &config.social.providers {
            let client = OAuthProviderClient::new(
                name.as_str(),
                provider.clone(),
                resolver.settings.provider_timeout,
            )?;
            resolver = resolver.with_provider(Arc::new(client));
        }
        Ok(resolver)
    }

    /// Register a provider under its own name, replacing any previous one.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn SocialProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// Find or create the user behind a provider identity. The flag is
    /// `true` when a new user was created.
    #[instrument(skip(self, tenant, profile), fields(app_id = tenant.app_id()))]
    pub async fn resolve_or_create(
        &self,
        tenant: &Tenant,
        provider: &str,
        profile: &ProviderProfile,
    ) -> Result<(User, bool)> {
        let Some(email) = profile.usable_email() else {
            warn!(provider, "Provider profile has no usable email");
            return Err(SocialProviderError::MissingEmail.into());
        };
        if profile.provider_user_id.trim().is_empty() {
            return Err(IdentityError::InvalidInput("provider user id is empty"));
        }

        let mut attempt = 1;
        loop {
            match self.try_resolve(tenant, provider, profile, &email).await {
                Err(IdentityError::Conflict) if attempt < RESOLVE_ATTEMPTS => {
                    info!(provider, attempt, "Concurrent social login, resolving again");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Resolve a provider profile and issue a token pair for its user.
    #[instrument(skip(self, tenant, profile), fields(app_id = tenant.app_id()))]
    pub async fn login(
        &self,
        tenant: &Tenant,
        provider: &str,
        profile: &ProviderProfile,
    ) -> Result<SocialLogin> {
        let (user, is_new_account) = self.resolve_or_create(tenant, provider, profile).await?;
        if !user.active {
            warn!(user_id = %user.id, provider, "Social login for deactivated user");
            return Err(IdentityError::Authentication);
        }

        let tokens = self.tokens.issue_pair(tenant, &user.id).await?;
        info!(user_id = %user.id, provider, is_new_account, "Social login");
        Ok(SocialLogin {
            user,
            is_new_account,
            tokens,
        })
    }

    /// Exchange an authorization code with a registered provider, then log
    /// the user in. The exchange is bounded by the provider timeout.
    #[instrument(skip(self, tenant, code), fields(app_id = tenant.app_id()))]
    pub async fn login_with_code(
        &self,
        tenant: &Tenant,
        provider: &str,
        code: &str,
    ) -> Result<SocialLogin> {
        let client = self
            .providers
            .get(provider)
            .ok_or(SocialProviderError::UnknownProvider)?;

        let profile = tokio::time::timeout(self.settings.provider_timeout, client.exchange(code))
            .await
            .map_err(|_| {
                warn!(provider, "Provider exchange timed out");
                SocialProviderError::Exchange { retryable: true }
            })??;

        self.login(tenant, client.name(), &profile).await
    }

    async fn try_resolve(
        &self,
        tenant: &Tenant,
        provider: &str,
        profile: &ProviderProfile,
        email: &str,
    ) -> Result<(User, bool)> {
        let deadline = self.settings.store_deadline;

        let account = with_deadline(
            deadline,
            "find_social_account",
            self.store.find_social_account(tenant, provider, &profile.provider_user_id),
        )
        .await?;
        if let Some(account) = account {
            let user = with_deadline(
                deadline,
                "get_user",
                self.store.get_user(tenant, &account.user_id),
            )
            .await?
            .ok_or_else(|| {
                IdentityError::internal("social account without user", &account.user_id)
            })?;
            let user = self.sync_profile(tenant, user, &account, profile).await;
            return Ok((user, false));
        }

        let existing = with_deadline(
            deadline,
            "find_user_by_email",
            self.store.find_user_by_email(tenant, email),
        )
        .await?;
        let new_account = NewSocialAccount {
            provider: provider.to_string(),
            provider_user_id: profile.provider_user_id.clone(),
            snapshot: profile.snapshot(),
            access_token: profile.access_token.clone(),
        };

        if let Some(user) = existing {
            with_deadline(
                deadline,
                "create_social_account",
                self.store.create_social_account(tenant, &user.id, &new_account),
            )
            .await?;
            info!(user_id = %user.id, provider, "Linked social account to existing user");
            let user = self.fill_profile(tenant, user, profile).await;
            return Ok((user, false));
        }

        let new_user = NewUser {
            email: email.to_string(),
            password_hash: None,
            email_verified: profile.email_verified,
            profile: Profile {
                name: profile.name.clone(),
                locale: profile.locale.clone(),
                avatar_url: profile.avatar_url.clone(),
            },
        };
        let (user, _) = with_deadline(
            deadline,
            "create_user_with_social",
            self.store.create_user_with_social(tenant, &new_user, &new_account),
        )
        .await?;
        info!(user_id = %user.id, provider, "Created user from social login");
        Ok((user, true))
    }

    /// Apply provider-side changes since the cached snapshot, then refresh
    /// the cache. Failures are logged and leave the user as loaded.
    async fn sync_profile(
        &self,
        tenant: &Tenant,
        mut user: User,
        account: &SocialAccount,
        profile: &ProviderProfile,
    ) -> User {
        let current = user.profile();
        let synced = drifted_profile(&current, &account.snapshot(), profile);

        if synced != current {
            let updated = with_deadline(
                self.settings.store_deadline,
                "update_profile",
                self.store.update_profile(tenant, &user.id, &synced),
            )
            .await;
            match updated {
                Ok(()) => user.apply_profile(synced),
                Err(e) => warn!(user_id = %user.id, error = %e, "Profile sync failed"),
            }
        }

        let snapshot = profile.snapshot();
        if snapshot != account.snapshot() || profile.access_token.is_some() {
            let refreshed = with_deadline(
                self.settings.store_deadline,
                "update_social_account",
                self.store.update_social_account(
                    tenant,
                    &account.id,
                    &snapshot,
                    profile.access_token.as_deref(),
                ),
            )
            .await;
            if let Err(e) = refreshed {
                warn!(user_id = %user.id, error = %e, "Provider snapshot refresh failed");
            }
        }

        user
    }

    /// Fill profile fields the user left empty and take over a verified
    /// email. Nothing the user already set is overwritten.
    async fn fill_profile(
        &self,
        tenant: &Tenant,
        mut user: User,
        profile: &ProviderProfile,
    ) -> User {
        let current = user.profile();
        let filled = Profile {
            name: current.name.clone().or_else(|| profile.name.clone()),
            locale: current.locale.clone().or_else(|| profile.locale.clone()),
            avatar_url: current.avatar_url.clone().or_else(|| profile.avatar_url.clone()),
        };

        if filled != current {
            let updated = with_deadline(
                self.settings.store_deadline,
                "update_profile",
                self.store.update_profile(tenant, &user.id, &filled),
            )
            .await;
            match updated {
                Ok(()) => user.apply_profile(filled),
                Err(e) => warn!(user_id = %user.id, error = %e, "Profile fill failed"),
            }
        }

        if profile.email_verified && !user.email_verified {
            let verified = with_deadline(
                self.settings.store_deadline,
                "mark_email_verified",
                self.store.mark_email_verified(tenant, &user.id),
            )
            .await;
            match verified {
                Ok(()) => user.email_verified = true,
                Err(e) => warn!(user_id = %user.id, error = %e, "Marking email verified failed"),
            }
        }

        user
    }
}

/// The user's profile with every field the provider changed since
/// `snapshot` taken from the provider. A field the provider stopped sending
/// keeps its local value.
fn drifted_profile(
    current: &Profile,
    snapshot: &ProviderSnapshot,
    profile: &ProviderProfile,
) -> Profile {
    let pick = |local: &Option<String>, cached: &Option<String>, fresh: &Option<String>| {
        match fresh {
            Some(value) if fresh != cached => Some(value.clone()),
            _ => local.clone(),
        }
    };
    Profile {
        name: pick(&current.name, &snapshot.name, &profile.name),
        locale: pick(&current.locale, &snapshot.locale, &profile.locale),
        avatar_url: pick(&current.avatar_url, &snapshot.avatar_url, &profile.avatar_url),
    }
}
