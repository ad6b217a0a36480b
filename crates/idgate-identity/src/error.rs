//! Errors surfaced by identity operations.
//!
//! Messages are intentionally generic: callers see the kind of failure, the
//! detail goes to the log.

use idgate_core::db::DatabaseError;
use tracing::error;

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,

    #[error("token has expired")]
    Expired,

    #[error("wrong token type")]
    WrongType,

    #[error("token has been revoked")]
    Revoked,

    /// The session was already rotated by another request.
    #[error("token is no longer valid")]
    Superseded,
}

/// Why a second-factor step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TwoFactorError {
    #[error("invalid code")]
    InvalidCode,

    #[error("no pending two-factor setup")]
    NoPendingSetup,

    #[error("two-factor secret not confirmed")]
    NotConfirmed,

    #[error("two-factor authentication already enabled")]
    AlreadyEnabled,

    #[error("two-factor authentication not enabled")]
    NotEnabled,

    #[error("recovery codes exhausted")]
    RecoveryCodesExhausted,
}

/// Why a social login failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SocialProviderError {
    #[error("provider profile has no usable email")]
    MissingEmail,

    #[error("unknown provider")]
    UnknownProvider,

    /// Code exchange failed. `retryable` failures (timeouts, transport) can
    /// be retried by the user; the rest need a new authorization.
    #[error("provider exchange failed")]
    Exchange { retryable: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Bad credentials. Identical for unknown email and wrong password.
    #[error("invalid credentials")]
    Authentication,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    TwoFactor(#[from] TwoFactorError),

    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("application not found")]
    TenantNotFound,

    #[error(transparent)]
    SocialProvider(#[from] SocialProviderError),

    #[error("account already exists")]
    Conflict,

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// Infrastructure failure; details are only logged.
    #[error("service temporarily unavailable")]
    Unavailable,

    #[error("configuration error: {0}")]
    Config(String),
}

impl IdentityError {
    /// Whether retrying the same request can succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::SocialProvider(SocialProviderError::Exchange { retryable: true })
        )
    }

    /// Log an infrastructure failure and hide it behind `Unavailable`.
    pub(crate) fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        error!(error = %err, "{context}");
        Self::Unavailable
    }
}

impl From<DatabaseError> for IdentityError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Conflict(_) => Self::Conflict,
            other => Self::internal("storage failure", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_details_are_not_echoed() {
        let err: IdentityError = DatabaseError::Query("disk I/O error at page 7".into()).into();
        assert!(matches!(err, IdentityError::Unavailable));
        assert!(!err.to_string().contains("page 7"));
        assert!(err.is_retryable());
    }

    #[test]
    fn unique_violation_is_conflict() {
        let err: IdentityError = DatabaseError::Conflict("UNIQUE constraint failed".into()).into();
        assert!(matches!(err, IdentityError::Conflict));
        assert!(!err.is_retryable());
    }

    #[test]
    fn lost_rotation_race_is_not_retryable() {
        let err = IdentityError::from(TokenError::Superseded);
        assert!(!err.is_retryable());
    }

    #[test]
    fn provider_timeout_is_retryable() {
        let err = IdentityError::from(SocialProviderError::Exchange { retryable: true });
        assert!(err.is_retryable());
        let err = IdentityError::from(SocialProviderError::MissingEmail);
        assert!(!err.is_retryable());
    }
}
