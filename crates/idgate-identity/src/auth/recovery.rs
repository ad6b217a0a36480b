//! Recovery code generation and hashing.
//!
//! Recovery codes are one-time credentials for when the authenticator app is
//! unavailable. Only a peppered SHA-256 digest of the normalized code is
//! stored; the digest is deterministic so a code can be consumed with a
//! single conditional update.

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

const RECOVERY_CODE_LEN: usize = 12;
const RECOVERY_CODE_GROUP_SIZE: usize = 4;
const RECOVERY_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated recovery-code batch (plaintext + digests).
#[derive(Debug)]
pub struct RecoveryCodeBatch {
    pub codes: Vec<String>,
    pub code_hashes: Vec<String>,
}

impl RecoveryCodeBatch {
    /// Generate `count` codes using the provided pepper.
    pub fn generate(count: usize, pepper: &[u8]) -> Self {
        let mut rng = OsRng;
        Self::generate_with_rng(&mut rng, count, pepper)
    }

    fn generate_with_rng<R: RngCore + ?Sized>(rng: &mut R, count: usize, pepper: &[u8]) -> Self {
        let mut codes = Vec::with_capacity(count);
        let mut code_hashes = Vec::with_capacity(count);
        while codes.len() < count {
            let normalized = generate_normalized(rng);
            let hash = digest(&normalized, pepper);
            // Duplicates inside one batch would collapse to a single row.
            if code_hashes.contains(&hash) {
                continue;
            }
            codes.push(format_recovery_code(&normalized));
            code_hashes.push(hash);
        }
        Self { codes, code_hashes }
    }
}

/// Normalize user input: drop separators, uppercase. `None` when the result
/// cannot be a recovery code.
pub fn normalize_recovery_code(input: &str) -> Option<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != RECOVERY_CODE_LEN {
        return None;
    }
    normalized
        .bytes()
        .all(|b| RECOVERY_CODE_ALPHABET.contains(&b))
        .then_some(normalized)
}

/// Digest of a user-supplied code, or `None` if it is not shaped like one.
pub fn hash_recovery_code(input: &str, pepper: &[u8]) -> Option<String> {
    normalize_recovery_code(input).map(|normalized| digest(&normalized, pepper))
}

/// Format a normalized code as `XXXX-XXXX-XXXX`.
fn format_recovery_code(normalized: &str) -> String {
    let mut out = String::with_capacity(RECOVERY_CODE_LEN + 2);
    for (idx, ch) in normalized.chars().enumerate() {
        if idx > 0 && idx % RECOVERY_CODE_GROUP_SIZE == 0 {
            out.push('-');
        }
        out.push(ch);
    }
    out
}

fn generate_normalized<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut raw = [0u8; RECOVERY_CODE_LEN];
    rng.fill_bytes(&mut raw);
    // 256 is a multiple of the 32-symbol alphabet, so the modulo is unbiased.
    raw.iter()
        .map(|b| char::from(RECOVERY_CODE_ALPHABET[usize::from(*b) % RECOVERY_CODE_ALPHABET.len()]))
        .collect()
}

fn digest(normalized: &str, pepper: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper);
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}
