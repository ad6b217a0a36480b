//! Configuration resolution for idgate.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. JSON config file (`--config` or `IDGATE_CONFIG`)
//! 3. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Minimum signing secret length in bytes (256 bits).
pub const MIN_SIGNING_SECRET_BYTES: usize = 32;

/// Complete idgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub two_factor: TwoFactorConfig,
    #[serde(default)]
    pub social: SocialConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub password: PasswordConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tokens: TokenConfig::default(),
            two_factor: TwoFactorConfig::default(),
            social: SocialConfig::default(),
            storage: StorageConfig::default(),
            password: PasswordConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What to do when an already-rotated refresh token is presented again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Reject the replay and revoke every live session of the token family.
    #[default]
    RevokeFamily,
    /// Reject only the replayed request.
    RejectOnly,
}

/// Token signing and lifetime configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC signing secret. Must be at least 32 bytes.
    #[serde(skip_serializing)]
    pub signing_secret: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_hours: i64,
    /// Lifetime of the pre-authentication token handed out while a second
    /// factor is outstanding.
    pub pending_ttl_minutes: i64,
    pub replay_policy: ReplayPolicy,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            access_ttl_minutes: 15,
            refresh_ttl_hours: 720,
            pending_ttl_minutes: 5,
            replay_policy: ReplayPolicy::default(),
        }
    }
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("signing_secret", &"<redacted>")
            .field("access_ttl_minutes", &self.access_ttl_minutes)
            .field("refresh_ttl_hours", &self.refresh_ttl_hours)
            .field("pending_ttl_minutes", &self.pending_ttl_minutes)
            .field("replay_policy", &self.replay_policy)
            .finish()
    }
}

impl TokenConfig {
    pub const fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_minutes * 60
    }

    pub const fn refresh_ttl_secs(&self) -> i64 {
        self.refresh_ttl_hours * 60 * 60
    }

    pub const fn pending_ttl_secs(&self) -> i64 {
        self.pending_ttl_minutes * 60
    }
}

/// Second-factor configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoFactorConfig {
    /// Issuer shown by authenticator apps.
    pub issuer: String,
    pub recovery_code_count: usize,
    /// Accepted clock drift in 30-second steps on either side.
    pub totp_skew: u8,
    /// Lifetime of an unconfirmed TOTP secret.
    pub setup_ttl_secs: i64,
    /// Server-side pepper mixed into recovery code digests.
    #[serde(skip_serializing)]
    pub recovery_pepper: String,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            issuer: "idgate".to_string(),
            recovery_code_count: 10,
            totp_skew: 1,
            setup_ttl_secs: 600,
            recovery_pepper: String::new(),
        }
    }
}

impl std::fmt::Debug for TwoFactorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoFactorConfig")
            .field("issuer", &self.issuer)
            .field("recovery_code_count", &self.recovery_code_count)
            .field("totp_skew", &self.totp_skew)
            .field("setup_ttl_secs", &self.setup_ttl_secs)
            .field("recovery_pepper", &"<redacted>")
            .finish()
    }
}

/// Social login configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialConfig {
    /// Request-scoped timeout for provider calls (seconds).
    pub provider_timeout_secs: u64,
    /// OAuth2 providers keyed by provider name (e.g. "github").
    pub providers: HashMap<String, OAuthProviderConfig>,
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: 10,
            providers: HashMap::new(),
        }
    }
}

/// Endpoints and claim mapping for one OAuth2 provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub fields: ProfileFieldMap,
}

impl std::fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("token_url", &self.token_url)
            .field("userinfo_url", &self.userinfo_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Names of the userinfo JSON fields a provider uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileFieldMap {
    pub id: String,
    pub email: String,
    pub email_verified: String,
    pub name: String,
    pub locale: String,
    pub avatar_url: String,
}

impl Default for ProfileFieldMap {
    fn default() -> Self {
        Self {
            id: "sub".to_string(),
            email: "email".to_string(),
            email_verified: "email_verified".to_string(),
            name: "name".to_string(),
            locale: "locale".to_string(),
            avatar_url: "picture".to_string(),
        }
    }
}

/// Which session store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
    pub session_backend: SessionBackend,
    /// Deadline applied to every store call (milliseconds).
    pub store_deadline_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            session_backend: SessionBackend::default(),
            store_deadline_ms: 2_000,
        }
    }
}

/// Argon2id cost parameters for password hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl Config {
    /// Reject configurations the services refuse to start with.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.signing_secret.len() < MIN_SIGNING_SECRET_BYTES {
            return Err(Error::Config(format!(
                "signing secret must be at least {MIN_SIGNING_SECRET_BYTES} bytes"
            )));
        }
        if self.tokens.access_ttl_minutes <= 0
            || self.tokens.refresh_ttl_hours <= 0
            || self.tokens.pending_ttl_minutes <= 0
        {
            return Err(Error::Config("token lifetimes must be positive".into()));
        }
        if self.two_factor.recovery_code_count == 0 {
            return Err(Error::Config(
                "recovery_code_count must be at least 1".into(),
            ));
        }
        if self.two_factor.setup_ttl_secs <= 0 {
            return Err(Error::Config("setup_ttl_secs must be positive".into()));
        }
        if self.storage.store_deadline_ms == 0 || self.social.provider_timeout_secs == 0 {
            return Err(Error::Config("deadlines must be positive".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` wins over `IDGATE_CONFIG`; a missing explicit file is
/// an error, no file at all means defaults plus environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let file = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("IDGATE_CONFIG").ok().map(PathBuf::from));

    let mut config = match file {
        Some(path) => load_config_file(&path)?,
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Default location of the identity database.
pub fn database_path() -> Option<PathBuf> {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".local").join("share"))
        })
        .map(|p| p.join("idgate").join("identity.db"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("IDGATE_SIGNING_SECRET") {
        config.tokens.signing_secret = val;
    }
    if let Some(val) = lookup("IDGATE_RECOVERY_PEPPER") {
        config.two_factor.recovery_pepper = val;
    }
    if let Some(val) = lookup("IDGATE_DATABASE_PATH") {
        config.storage.database_path = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("IDGATE_ACCESS_TTL_MINUTES").and_then(|v| v.parse().ok()) {
        config.tokens.access_ttl_minutes = n;
    }
    if let Some(n) = lookup("IDGATE_REFRESH_TTL_HOURS").and_then(|v| v.parse().ok()) {
        config.tokens.refresh_ttl_hours = n;
    }
    if let Some(val) = lookup("IDGATE_LOG_LEVEL") {
        config.log_level = val;
    }
}
