//! Third-party identity providers.
//!
//! A [`SocialProvider`] turns an authorization code into a
//! [`ProviderProfile`]. What happens to that profile (linking, account
//! creation, profile sync) is decided by
//! [`SocialIdentityResolver`](crate::service::SocialIdentityResolver).

mod provider;

use async_trait::async_trait;

use crate::error::SocialProviderError;
use crate::storage::{ProviderSnapshot, normalize_email};

pub use provider::OAuthProviderClient;

/// The profile a provider asserts for one of its users.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_user_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub locale: Option<String>,
    pub avatar_url: Option<String>,
    /// Provider access token, cached on the social account.
    pub access_token: Option<String>,
}

impl ProviderProfile {
    /// The normalized email, if the provider sent one that looks usable.
    pub fn usable_email(&self) -> Option<String> {
        let email = normalize_email(self.email.as_deref()?);
        let (local, domain) = email.split_once('@')?;
        (!local.is_empty() && !domain.is_empty()).then_some(email)
    }

    pub fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            email: self.usable_email(),
            name: self.name.clone(),
            locale: self.locale.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

impl std::fmt::Debug for ProviderProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderProfile")
            .field("provider_user_id", &self.provider_user_id)
            .field("email", &self.email)
            .field("email_verified", &self.email_verified)
            .field("name", &self.name)
            .field("locale", &self.locale)
            .field("avatar_url", &self.avatar_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// An OAuth-style identity provider.
#[async_trait]
pub trait SocialProvider: Send + Sync {
    /// Provider name as stored on social accounts (e.g. "github").
    fn name(&self) -> &str;

    /// Exchange an authorization code for the user's profile.
    async fn exchange(&self, code: &str) -> Result<ProviderProfile, SocialProviderError>;
}
