//! SQLite database for idgate identity storage.

idgate_core::define_database!(IdentityDatabase, "Identity database migrations complete");
