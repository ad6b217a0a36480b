//! `idgate` Core Library
//!
//! Shared functionality for `idgate` components:
//! - Configuration resolution (defaults, JSON file, environment)
//! - Injectable clock for expiry and TOTP checks
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Common error types and tracing initialisation

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
