//! Data models for idgate identity storage.

use serde::{Deserialize, Serialize};

/// A tenant application.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Application {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub app_id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub active: bool,
    pub name: Option<String>,
    pub locale: Option<String>,
    pub avatar_url: Option<String>,
    pub two_factor_enabled: bool,
    #[serde(skip_serializing)]
    pub totp_secret: Option<String>,
    #[serde(skip_serializing)]
    pub totp_last_step: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    pub fn profile(&self) -> Profile {
        Profile {
            name: self.name.clone(),
            locale: self.locale.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }

    pub fn apply_profile(&mut self, profile: Profile) {
        self.name = profile.name;
        self.locale = profile.locale;
        self.avatar_url = profile.avatar_url;
    }
}

/// User-editable profile fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: Option<String>,
    pub locale: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SocialAccount {
    pub id: String,
    pub app_id: String,
    pub user_id: String,
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub locale: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SocialAccount {
    /// The provider profile as it looked at the last sync.
    pub fn snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            email: self.email.clone(),
            name: self.name.clone(),
            locale: self.locale.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Cached copy of the provider-side profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSnapshot {
    pub email: Option<String>,
    pub name: Option<String>,
    pub locale: Option<String>,
    pub avatar_url: Option<String>,
}

/// Input for user creation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub profile: Profile,
}

/// Input for social account creation.
#[derive(Debug, Clone)]
pub struct NewSocialAccount {
    pub provider: String,
    pub provider_user_id: String,
    pub snapshot: ProviderSnapshot,
    pub access_token: Option<String>,
}

/// A pending login being closed with a second factor.
#[derive(Debug, Clone, Copy)]
pub struct SecondFactorChallenge<'a> {
    /// `token_id` of the pending token.
    pub token_id: &'a str,
    pub user_id: &'a str,
    pub expires_at: i64,
}

/// What the user presented as the second factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondFactorProof {
    /// A matched TOTP time step.
    TotpStep(i64),
    /// Digest of a recovery code.
    RecoveryCode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Completed,
    /// Another request already redeemed the pending token.
    AlreadyCompleted,
    /// The step was not newer than the last one, or the recovery code is
    /// unknown or used.
    ProofRejected,
}

/// Emails are compared case-insensitively and without surrounding space.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
