//! TOTP enrollment, recovery codes and second-factor login.
//!
//! Per user the engine moves through `Disabled -> PendingSetup -> Enabled`
//! and back to `Disabled`. An unconfirmed secret lives in its own table
//! until a code proves the authenticator app has it; only then is it
//! written to the user.

use std::sync::Arc;
use std::time::Duration;

use idgate_core::Clock;
use idgate_core::config::Config;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::tokens::{TokenPair, TokenService};
use crate::auth::OtpGenerator;
use crate::auth::otp::OtpError;
use crate::auth::recovery::{RecoveryCodeBatch, hash_recovery_code};
use crate::deadline::with_deadline;
use crate::error::{IdentityError, Result, TokenError, TwoFactorError};
use crate::storage::{
    ChallengeOutcome, IdentityStore, SecondFactorChallenge, SecondFactorProof, User,
};
use crate::tenant::Tenant;

/// Where a user stands in two-factor enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorState {
    Disabled,
    /// A secret was generated or confirmed but 2FA is not switched on yet.
    PendingSetup,
    Enabled,
}

/// A newly generated secret, shown to the user once.
#[derive(Clone, Serialize)]
pub struct SecretProvisioning {
    pub secret: String,
    pub provisioning_uri: String,
}

impl std::fmt::Debug for SecretProvisioning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretProvisioning")
            .field("secret", &"<redacted>")
            .field("provisioning_uri", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct TwoFactorSettings {
    pub recovery_code_count: usize,
    pub setup_ttl_secs: i64,
    pub recovery_pepper: Vec<u8>,
    pub store_deadline: Duration,
}

impl TwoFactorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recovery_code_count: config.two_factor.recovery_code_count,
            setup_ttl_secs: config.two_factor.setup_ttl_secs,
            recovery_pepper: config.two_factor.recovery_pepper.as_bytes().to_vec(),
            store_deadline: Duration::from_millis(config.storage.store_deadline_ms),
        }
    }
}

impl Default for TwoFactorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct TwoFactorEngine {
    store: Arc<dyn IdentityStore>,
    otp: Arc<dyn OtpGenerator>,
    tokens: Arc<TokenService>,
    clock: Arc<dyn Clock>,
    settings: TwoFactorSettings,
}

impl TwoFactorEngine {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        otp: Arc<dyn OtpGenerator>,
        tokens: Arc<TokenService>,
        clock: Arc<dyn Clock>,
        settings: TwoFactorSettings,
    ) -> Self {
        Self {
            store,
            otp,
            tokens,
            clock,
            settings,
        }
    }

    #[instrument(skip(self, tenant), fields(app_id = tenant.app_id()))]
    pub async fn status(&self, tenant: &Tenant, user_id: &str) -> Result<TwoFactorState> {
        let user = self.user(tenant, user_id).await?;
        if user.two_factor_enabled {
            return Ok(TwoFactorState::Enabled);
        }
        if user.totp_secret.is_some() {
            return Ok(TwoFactorState::PendingSetup);
        }

        let pending = with_deadline(
            self.settings.store_deadline,
            "has_pending_secret",
            self.store.has_pending_secret(tenant, user_id, self.clock.now()),
        )
        .await?;
        Ok(if pending {
            TwoFactorState::PendingSetup
        } else {
            TwoFactorState::Disabled
        })
    }

    /// Start enrollment: store a pending secret and return it with its
    /// provisioning URI. A second call replaces the pending secret.
    #[instrument(skip(self, tenant), fields(app_id = tenant.app_id()))]
    pub async fn generate_secret(
        &self,
        tenant: &Tenant,
        user_id: &str,
    ) -> Result<SecretProvisioning> {
        let user = self.user(tenant, user_id).await?;
        if user.two_factor_enabled {
            return Err(TwoFactorError::AlreadyEnabled.into());
        }

        let secret = self.otp.generate_secret().map_err(otp_failure)?;
        let provisioning_uri = self
            .otp
            .provisioning_uri(&secret, &user.email)
            .map_err(otp_failure)?;
        let expires_at = self.clock.now() + self.settings.setup_ttl_secs;

        with_deadline(
            self.settings.store_deadline,
            "put_pending_secret",
            self.store.put_pending_secret(tenant, user_id, &secret, expires_at),
        )
        .await?;

        info!(user_id, "Two-factor setup started");
        Ok(SecretProvisioning {
            secret,
            provisioning_uri,
        })
    }

    /// Confirm the pending secret with a code from the authenticator app.
    /// The pending secret is discarded whether or not the code matches.
    #[instrument(skip(self, tenant, code), fields(app_id = tenant.app_id()))]
    pub async fn verify_setup(&self, tenant: &Tenant, user_id: &str, code: &str) -> Result<()> {
        let now = self.clock.now();
        let secret = with_deadline(
            self.settings.store_deadline,
            "take_pending_secret",
            self.store.take_pending_secret(tenant, user_id, now),
        )
        .await?
        .ok_or(TwoFactorError::NoPendingSetup)?;

        let step = self
            .otp
            .verify(&secret, code.trim(), now)
            .map_err(otp_failure)?;
        let Some(step) = step else {
            warn!(user_id, "Two-factor setup code rejected");
            return Err(TwoFactorError::InvalidCode.into());
        };

        let confirmed = with_deadline(
            self.settings.store_deadline,
            "confirm_secret",
            self.store.confirm_secret(tenant, user_id, &secret),
        )
        .await?;
        if !confirmed {
            return Err(TwoFactorError::AlreadyEnabled.into());
        }

        // The confirmation code is spent; it cannot also complete a login.
        self.spend_step(tenant, user_id, step).await?;

        info!(user_id, "Two-factor secret confirmed");
        Ok(())
    }

    /// Switch 2FA on and return a fresh batch of recovery codes. The
    /// plaintext codes are never stored and cannot be shown again.
    #[instrument(skip(self, tenant), fields(app_id = tenant.app_id()))]
    pub async fn enable(&self, tenant: &Tenant, user_id: &str) -> Result<Vec<String>> {
        let user = self.user(tenant, user_id).await?;
        if user.two_factor_enabled {
            return Err(TwoFactorError::AlreadyEnabled.into());
        }
        if user.totp_secret.is_none() {
            return Err(TwoFactorError::NotConfirmed.into());
        }

        let batch = RecoveryCodeBatch::generate(
            self.settings.recovery_code_count,
            &self.settings.recovery_pepper,
        );
        let enabled = with_deadline(
            self.settings.store_deadline,
            "enable_two_factor",
            self.store.enable_two_factor(tenant, user_id, &batch.code_hashes),
        )
        .await?;

        if !enabled {
            // Lost a race with another enable or disable.
            let user = self.user(tenant, user_id).await?;
            let err = if user.two_factor_enabled {
                TwoFactorError::AlreadyEnabled
            } else {
                TwoFactorError::NotConfirmed
            };
            return Err(err.into());
        }

        info!(user_id, codes = batch.codes.len(), "Two-factor enabled");
        Ok(batch.codes)
    }

    /// Turn 2FA off, clearing the secret and every recovery code.
    #[instrument(skip(self, tenant), fields(app_id = tenant.app_id()))]
    pub async fn disable(&self, tenant: &Tenant, user_id: &str) -> Result<()> {
        let user = self.user(tenant, user_id).await?;
        if !user.two_factor_enabled && user.totp_secret.is_none() {
            return Err(TwoFactorError::NotEnabled.into());
        }

        with_deadline(
            self.settings.store_deadline,
            "disable_two_factor",
            self.store.disable_two_factor(tenant, user_id),
        )
        .await?;

        info!(user_id, "Two-factor disabled");
        Ok(())
    }

    /// Finish a login that stopped at the second factor. Accepts a current
    /// TOTP code or an unused recovery code.
    ///
    /// Redeeming the pending token and spending the code happen in one store
    /// transaction, so a rejected code leaves the pending token usable and a
    /// request that loses the race for the pending token spends no code.
    #[instrument(skip(self, tenant, pending_token, code), fields(app_id = tenant.app_id()))]
    pub async fn login_verify(
        &self,
        tenant: &Tenant,
        pending_token: &str,
        code: &str,
    ) -> Result<TokenPair> {
        let claims = self.tokens.validate_pending(tenant, pending_token)?;
        let user_id = claims.user_id.as_str();
        let token_id = claims.token_id.as_deref().ok_or(TokenError::Malformed)?;

        let user = self.user(tenant, user_id).await?;
        if !user.active {
            return Err(IdentityError::Authentication);
        }
        if !user.two_factor_enabled {
            return Err(TwoFactorError::NotEnabled.into());
        }

        let proof = self.proof(tenant, &user, code.trim()).await?;

        // Issued before the challenge closes so an issuing failure spends
        // nothing; dropped unless this request closes the challenge.
        let pair = self.tokens.issue_pair(tenant, user_id).await?;
        let challenge = SecondFactorChallenge {
            token_id,
            user_id,
            expires_at: claims.exp,
        };
        let outcome = with_deadline(
            self.settings.store_deadline,
            "complete_second_factor",
            self.store.complete_second_factor(tenant, challenge, &proof, self.clock.now()),
        )
        .await;

        let rejection: IdentityError = match outcome {
            Ok(ChallengeOutcome::Completed) => {
                if matches!(proof, SecondFactorProof::RecoveryCode(_)) {
                    info!(user_id, "Recovery code used");
                }
                info!(user_id, "Second factor verified");
                return Ok(pair);
            }
            Ok(ChallengeOutcome::AlreadyCompleted) => {
                warn!(user_id, "Pending token already redeemed");
                TokenError::Revoked.into()
            }
            Ok(ChallengeOutcome::ProofRejected) => {
                warn!(user_id, "Second-factor code reused or unknown");
                TwoFactorError::InvalidCode.into()
            }
            Err(e) => e,
        };
        self.tokens.discard_pair(tenant, &pair).await;
        Err(rejection)
    }

    /// Turn the presented code into something the store can spend. Nothing
    /// is written here.
    async fn proof(&self, tenant: &Tenant, user: &User, code: &str) -> Result<SecondFactorProof> {
        if is_totp_shaped(code) {
            let secret = user
                .totp_secret
                .as_deref()
                .ok_or(TwoFactorError::NotEnabled)?;
            let step = self
                .otp
                .verify(secret, code, self.clock.now())
                .map_err(otp_failure)?;
            let Some(step) = step else {
                warn!(user_id = %user.id, "TOTP code rejected");
                return Err(TwoFactorError::InvalidCode.into());
            };
            let step = i64::try_from(step).map_err(|e| IdentityError::internal("totp step", e))?;
            return Ok(SecondFactorProof::TotpStep(step));
        }

        let remaining = with_deadline(
            self.settings.store_deadline,
            "count_recovery_codes",
            self.store.count_unused_recovery_codes(tenant, &user.id),
        )
        .await?;
        if remaining == 0 {
            return Err(TwoFactorError::RecoveryCodesExhausted.into());
        }

        hash_recovery_code(code, &self.settings.recovery_pepper)
            .map(SecondFactorProof::RecoveryCode)
            .ok_or_else(|| TwoFactorError::InvalidCode.into())
    }

    /// Record a matched TOTP step. A step at or before the last used one is
    /// a replayed code.
    async fn spend_step(&self, tenant: &Tenant, user_id: &str, step: u64) -> Result<()> {
        let step = i64::try_from(step).map_err(|e| IdentityError::internal("totp step", e))?;
        let advanced = with_deadline(
            self.settings.store_deadline,
            "advance_totp_step",
            self.store.advance_totp_step(tenant, user_id, step),
        )
        .await?;

        if advanced {
            Ok(())
        } else {
            warn!(user_id, step, "TOTP code reused");
            Err(TwoFactorError::InvalidCode.into())
        }
    }

    /// Load a user of the tenant. Unknown users look like bad credentials.
    async fn user(&self, tenant: &Tenant, user_id: &str) -> Result<User> {
        with_deadline(
            self.settings.store_deadline,
            "get_user",
            self.store.get_user(tenant, user_id),
        )
        .await?
        .ok_or(IdentityError::Authentication)
    }
}

fn is_totp_shaped(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

fn otp_failure(e: OtpError) -> IdentityError {
    IdentityError::internal("otp failure", e)
}
