//! idgate identity core
//!
//! Identity and session lifecycle for multi-tenant applications:
//! - Tenant scoping that every identity operation passes through
//! - Signed access/refresh tokens with atomic rotation and replay detection
//! - TOTP second factor with single-use recovery codes
//! - Social identity resolution and OAuth2 code exchange
//! - `SQLite` persistence behind repository traits

pub mod auth;
mod deadline;
pub mod error;
pub mod service;
pub mod session;
pub mod social;
pub mod storage;
pub mod tenant;

pub use error::{IdentityError, Result};
pub use tenant::{Tenant, TenantScope};
