//! Identity services.
//!
//! Each service takes a [`Tenant`](crate::tenant::Tenant) produced by
//! [`TenantScope`](crate::tenant::TenantScope) and reaches storage only
//! through the injected repository and session store traits.

pub mod accounts;
pub mod social;
pub mod tokens;
pub mod two_factor;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod social_tests;
#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tokens_tests;

pub use accounts::{AccountService, LoginOutcome};
pub use social::{SocialIdentityResolver, SocialLogin, SocialSettings};
pub use tokens::{TokenPair, TokenService, TokenSettings};
pub use two_factor::{SecretProvisioning, TwoFactorEngine, TwoFactorSettings, TwoFactorState};
