//! Time-based one-time passwords (RFC 6238: SHA-1, 6 digits, 30 s steps).

use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};

/// Length of one TOTP time step in seconds.
pub const STEP_SECS: u64 = 30;
const DIGITS: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("invalid TOTP secret: {0}")]
    Secret(String),
}

/// Generates secrets and checks codes against them.
pub trait OtpGenerator: Send + Sync {
    /// A fresh base32 secret.
    fn generate_secret(&self) -> Result<String, OtpError>;

    /// `otpauth://` URI for rendering as a QR code.
    fn provisioning_uri(&self, secret: &str, account: &str) -> Result<String, OtpError>;

    /// The time step `code` is valid for at `now`, within the drift window.
    fn verify(&self, secret: &str, code: &str, now: i64) -> Result<Option<u64>, OtpError>;
}

/// `totp-rs` backed generator.
#[derive(Debug, Clone)]
pub struct TotpGenerator {
    issuer: String,
    skew: u8,
}

impl TotpGenerator {
    pub fn new(issuer: impl Into<String>, skew: u8) -> Self {
        Self {
            issuer: issuer.into(),
            skew,
        }
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP, OtpError> {
        // Skew is handled in `verify` so the matched step is known.
        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            0,
            STEP_SECS,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| OtpError::Secret(e.to_string()))
    }

    fn decode(secret: &str) -> Result<Vec<u8>, OtpError> {
        Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|e| OtpError::Secret(format!("{e:?}")))
    }

    /// The code for the step containing `now`. Test helper for callers that
    /// need to play the authenticator app.
    pub fn code_at(&self, secret: &str, now: i64) -> Result<String, OtpError> {
        let totp = self.totp(Self::decode(secret)?, "code")?;
        Ok(totp.generate(u64::try_from(now).unwrap_or_default()))
    }
}

impl OtpGenerator for TotpGenerator {
    fn generate_secret(&self) -> Result<String, OtpError> {
        let bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| OtpError::Secret(format!("{e:?}")))?;
        Ok(self.totp(bytes, "setup")?.get_secret_base32())
    }

    fn provisioning_uri(&self, secret: &str, account: &str) -> Result<String, OtpError> {
        Ok(self.totp(Self::decode(secret)?, account)?.get_url())
    }

    fn verify(&self, secret: &str, code: &str, now: i64) -> Result<Option<u64>, OtpError> {
        if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(None);
        }

        let totp = self.totp(Self::decode(secret)?, "verify")?;
        let skew = i64::from(self.skew);
        #[allow(clippy::cast_possible_wrap)]
        let step = STEP_SECS as i64;

        for offset in -skew..=skew {
            let Ok(at) = u64::try_from(now + offset * step) else {
                continue;
            };
            let expected = totp.generate(at);
            if bool::from(expected.as_bytes().ct_eq(code.as_bytes())) {
                return Ok(Some(at / STEP_SECS));
            }
        }
        Ok(None)
    }
}
