//! JWT signing and signature verification.
//!
//! Expiry is deliberately *not* checked here: the token service compares
//! `exp` against its injected clock so tests can control time.

use std::collections::HashSet;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};

use super::claims::Claims;
use idgate_core::config::MIN_SIGNING_SECRET_BYTES;

/// Signing failures.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signing secret must be at least {MIN_SIGNING_SECRET_BYTES} bytes")]
    WeakSecret,

    #[error("token encoding failed: {0}")]
    Encode(String),

    #[error("token rejected")]
    Invalid,
}

/// Turns claims into signed tokens and back.
pub trait TokenSigner: Send + Sync {
    fn sign(&self, claims: &Claims) -> Result<String, SignerError>;

    /// Verify the signature and decode the claims. Does not check expiry.
    fn verify(&self, token: &str) -> Result<Claims, SignerError>;
}

/// HS256 JWT signer.
#[derive(Clone)]
pub struct JwtSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtSigner {
    /// Create a signer, refusing secrets shorter than 256 bits.
    pub fn new(secret: &[u8]) -> Result<Self, SignerError> {
        if secret.len() < MIN_SIGNING_SECRET_BYTES {
            return Err(SignerError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::from(["exp".to_string()]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        })
    }
}

impl TokenSigner for JwtSigner {
    fn sign(&self, claims: &Claims) -> Result<String, SignerError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| SignerError::Encode(e.to_string()))
    }

    fn verify(&self, token: &str) -> Result<Claims, SignerError> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| SignerError::Invalid)
    }
}
