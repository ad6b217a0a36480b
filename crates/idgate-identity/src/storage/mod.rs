//! SQLite storage for idgate.
//!
//! Provides persistence for applications, users, social accounts and
//! second-factor state behind the repository traits in [`repository`].

mod db;
mod models;
mod queries;
mod queries_social;
mod queries_two_factor;
pub mod repository;


pub use db::IdentityDatabase;
pub use idgate_core::db::DatabaseError;
pub use models::*;
pub use repository::{
    ApplicationRepository, IdentityStore, SecondFactorRepository, SocialAccountRepository,
    UserRepository,
};
