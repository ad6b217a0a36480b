//! Authentication capabilities for idgate.
//!
//! Token signing, password hashing, TOTP and recovery codes sit behind small
//! traits so services can be tested with doubles and algorithms can migrate.

pub mod claims;
pub mod jwt;
pub mod otp;
pub mod password;
pub mod recovery;

pub use claims::{Claims, TokenType};
pub use jwt::{JwtSigner, SignerError, TokenSigner};
pub use otp::{OtpGenerator, TotpGenerator};
pub use password::{Argon2Hasher, PasswordHasher};
