//! Token issuance, validation, rotation and revocation.

use std::sync::Arc;
use std::time::Duration;

use idgate_core::Clock;
use idgate_core::config::{Config, ReplayPolicy};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::auth::{Claims, JwtSigner, SignerError, TokenSigner, TokenType};
use crate::deadline::with_deadline;
use crate::error::{IdentityError, Result, TokenError};
use crate::session::{
    RevocationEntry, RevocationReason, RotateOutcome, SessionRecord, SessionStore,
};
use crate::tenant::{Tenant, TenantScope};

/// An access token and the refresh token that can renew it.
#[derive(Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// Lifetimes and policy for [`TokenService`].
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub pending_ttl_secs: i64,
    pub replay_policy: ReplayPolicy,
    pub store_deadline: Duration,
}

impl TokenSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            access_ttl_secs: config.tokens.access_ttl_secs(),
            refresh_ttl_secs: config.tokens.refresh_ttl_secs(),
            pending_ttl_secs: config.tokens.pending_ttl_secs(),
            replay_policy: config.tokens.replay_policy,
            store_deadline: Duration::from_millis(config.storage.store_deadline_ms),
        }
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct TokenService {
    signer: Arc<dyn TokenSigner>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    settings: TokenSettings,
}

impl TokenService {
    pub fn new(
        signer: Arc<dyn TokenSigner>,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        settings: TokenSettings,
    ) -> Self {
        Self {
            signer,
            sessions,
            clock,
            settings,
        }
    }

    /// Build an HS256 token service from configuration. Fails when the
    /// signing secret is shorter than 256 bits.
    pub fn from_config(
        config: &Config,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let signer = JwtSigner::new(config.tokens.signing_secret.as_bytes())
            .map_err(|e| IdentityError::Config(e.to_string()))?;
        Ok(Self::new(
            Arc::new(signer),
            sessions,
            clock,
            TokenSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    /// Issue a fresh pair for a new login, starting a new token family.
    #[instrument(skip(self, tenant), fields(app_id = tenant.app_id()))]
    pub async fn issue_pair(&self, tenant: &Tenant, user_id: &str) -> Result<TokenPair> {
        let now = self.clock.now();
        let record = self.new_session(tenant, user_id, new_id(), now);
        let pair = self.sign_pair(&record, now)?;

        let inserted = with_deadline(
            self.settings.store_deadline,
            "session_insert",
            self.sessions.insert(tenant, &record),
        )
        .await?;
        if !inserted {
            return Err(IdentityError::internal(
                "session insert",
                format!("token id {} already present", record.token_id),
            ));
        }

        info!(user_id, token_id = %record.token_id, "Token pair issued");
        Ok(pair)
    }

    /// Validate an access token presented under `tenant`.
    pub fn validate_access(&self, tenant: &Tenant, token: &str) -> Result<Claims> {
        self.verify(tenant, token, TokenType::Access)
    }

    /// Exchange a refresh token for a new pair. The old token stops working
    /// in the same atomic step that creates its successor.
    #[instrument(skip(self, tenant, refresh_token), fields(app_id = tenant.app_id()))]
    pub async fn rotate(&self, tenant: &Tenant, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.verify(tenant, refresh_token, TokenType::Refresh)?;
        let token_id = session_id(&claims)?;
        let now = self.clock.now();

        let current = with_deadline(
            self.settings.store_deadline,
            "session_get",
            self.sessions.get(tenant, token_id, now),
        )
        .await?;

        let Some(current) = current else {
            // Not live at the start of the request: a rotated token here is a replay.
            let entry = with_deadline(
                self.settings.store_deadline,
                "revocation_lookup",
                self.sessions.revocation(tenant, token_id, now),
            )
            .await?;
            return Err(match entry {
                Some(entry) if entry.reason == RevocationReason::Rotated => {
                    self.handle_replay(tenant, &entry, now).await?;
                    TokenError::Superseded.into()
                }
                _ => TokenError::Revoked.into(),
            });
        };

        let successor = self.new_session(tenant, &claims.user_id, current.family_id, now);
        let pair = self.sign_pair(&successor, now)?;

        let outcome = with_deadline(
            self.settings.store_deadline,
            "session_rotate",
            self.sessions.rotate(tenant, token_id, &successor, now),
        )
        .await?;

        match outcome {
            RotateOutcome::Rotated(_) => {
                info!(
                    user_id = %claims.user_id,
                    old_token_id = token_id,
                    token_id = %successor.token_id,
                    "Refresh token rotated"
                );
                Ok(pair)
            }
            RotateOutcome::Revoked(entry) if entry.reason == RevocationReason::Rotated => {
                warn!(token_id, "Lost concurrent rotation");
                Err(TokenError::Superseded.into())
            }
            RotateOutcome::Revoked(_) | RotateOutcome::Missing => Err(TokenError::Revoked.into()),
        }
    }

    /// Log out one session. Idempotent; an expired token counts as already
    /// logged out.
    #[instrument(skip(self, tenant, refresh_token), fields(app_id = tenant.app_id()))]
    pub async fn revoke(&self, tenant: &Tenant, refresh_token: &str) -> Result<()> {
        let claims = match self.verify(tenant, refresh_token, TokenType::Refresh) {
            Ok(claims) => claims,
            Err(IdentityError::Token(TokenError::Expired)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let token_id = session_id(&claims)?;
        let now = self.clock.now();

        let removed = with_deadline(
            self.settings.store_deadline,
            "session_remove",
            self.sessions.remove(tenant, token_id),
        )
        .await?;

        let entry = RevocationEntry {
            token_id: token_id.to_owned(),
            app_id: tenant.app_id().to_owned(),
            user_id: claims.user_id.clone(),
            family_id: removed.map(|r| r.family_id),
            reason: RevocationReason::Logout,
            expires_at: claims.exp,
        };
        let added = with_deadline(
            self.settings.store_deadline,
            "revoke",
            self.sessions.revoke(tenant, &entry, now),
        )
        .await?;

        if added {
            info!(user_id = %claims.user_id, token_id, "Session logged out");
        }
        Ok(())
    }

    /// Revoke every live session of a user. Returns how many were ended.
    #[instrument(skip(self, tenant), fields(app_id = tenant.app_id()))]
    pub async fn revoke_all(&self, tenant: &Tenant, user_id: &str) -> Result<u64> {
        let now = self.clock.now();
        let count = with_deadline(
            self.settings.store_deadline,
            "revoke_user",
            self.sessions.revoke_user(tenant, user_id, RevocationReason::Admin, now),
        )
        .await?;

        info!(user_id, sessions = count, "All sessions revoked");
        Ok(count)
    }

    /// Issue the short-lived token that stands in for a login until the
    /// second factor is verified.
    pub fn issue_pending(&self, tenant: &Tenant, user_id: &str) -> Result<String> {
        let now = self.clock.now();
        let claims = Claims {
            user_id: user_id.to_owned(),
            app_id: tenant.app_id().to_owned(),
            token_type: TokenType::PendingTwoFactor,
            token_id: Some(new_id()),
            iat: now,
            exp: now + self.settings.pending_ttl_secs,
        };
        self.signer.sign(&claims).map_err(sign_failure)
    }

    /// Check a pre-authentication token. Whether it was already redeemed is
    /// decided when the second factor is spent, not here.
    pub fn validate_pending(&self, tenant: &Tenant, token: &str) -> Result<Claims> {
        let claims = self.verify(tenant, token, TokenType::PendingTwoFactor)?;
        session_id(&claims)?;
        Ok(claims)
    }

    /// Drop the session behind a pair that was never handed out.
    pub(crate) async fn discard_pair(&self, tenant: &Tenant, pair: &TokenPair) {
        let Ok(claims) = self.verify(tenant, &pair.refresh_token, TokenType::Refresh) else {
            return;
        };
        let Some(token_id) = claims.token_id.as_deref() else {
            return;
        };

        let removed = with_deadline(
            self.settings.store_deadline,
            "session_remove",
            self.sessions.remove(tenant, token_id),
        )
        .await;
        if let Err(e) = removed {
            warn!(token_id, error = %e, "Unused session left to expire");
        }
    }

    /// Drop expired sessions and revocation entries.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = with_deadline(
            self.settings.store_deadline,
            "purge_expired",
            self.sessions.purge_expired(self.clock.now()),
        )
        .await?;

        info!(purged, "Expired session state purged");
        Ok(purged)
    }

    /// Signature, tenant, type, expiry; in that order.
    fn verify(&self, tenant: &Tenant, token: &str, expected: TokenType) -> Result<Claims> {
        let claims = self.signer.verify(token).map_err(|_| TokenError::Malformed)?;

        TenantScope::authorize(&claims.app_id, tenant)?;

        if claims.token_type != expected {
            warn!(
                expected = %expected,
                presented = %claims.token_type,
                "Token type mismatch"
            );
            return Err(TokenError::WrongType.into());
        }
        if claims.is_expired(self.clock.now()) {
            return Err(TokenError::Expired.into());
        }
        Ok(claims)
    }

    async fn handle_replay(
        &self,
        tenant: &Tenant,
        entry: &RevocationEntry,
        now: i64,
    ) -> Result<()> {
        warn!(
            token_id = %entry.token_id,
            user_id = %entry.user_id,
            policy = ?self.settings.replay_policy,
            "Rotated refresh token replayed"
        );

        if self.settings.replay_policy != ReplayPolicy::RevokeFamily {
            return Ok(());
        }
        let Some(family_id) = entry.family_id.as_deref() else {
            return Ok(());
        };

        let revoked = with_deadline(
            self.settings.store_deadline,
            "revoke_family",
            self.sessions.revoke_family(tenant, family_id, RevocationReason::Replay, now),
        )
        .await?;
        warn!(family_id, sessions = revoked, "Token family revoked after replay");
        Ok(())
    }

    fn new_session(
        &self,
        tenant: &Tenant,
        user_id: &str,
        family_id: String,
        now: i64,
    ) -> SessionRecord {
        SessionRecord {
            token_id: new_id(),
            family_id,
            user_id: user_id.to_owned(),
            app_id: tenant.app_id().to_owned(),
            issued_at: now,
            expires_at: now + self.settings.refresh_ttl_secs,
        }
    }

    fn sign_pair(&self, session: &SessionRecord, now: i64) -> Result<TokenPair> {
        let access = Claims {
            user_id: session.user_id.clone(),
            app_id: session.app_id.clone(),
            token_type: TokenType::Access,
            token_id: None,
            iat: now,
            exp: now + self.settings.access_ttl_secs,
        };
        let refresh = Claims {
            user_id: session.user_id.clone(),
            app_id: session.app_id.clone(),
            token_type: TokenType::Refresh,
            token_id: Some(session.token_id.clone()),
            iat: now,
            exp: session.expires_at,
        };

        Ok(TokenPair {
            access_token: self.signer.sign(&access).map_err(sign_failure)?,
            refresh_token: self.signer.sign(&refresh).map_err(sign_failure)?,
            access_expires_at: access.exp,
            refresh_expires_at: refresh.exp,
        })
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn session_id(claims: &Claims) -> Result<&str> {
    claims
        .token_id
        .as_deref()
        .ok_or_else(|| TokenError::Malformed.into())
}

fn sign_failure(e: SignerError) -> IdentityError {
    IdentityError::internal("token signing failed", e)
}
