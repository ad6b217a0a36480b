//! idgate admin tool
//!
//! Maintenance commands against the identity database: schema setup, tenant
//! creation, session revocation and cleanup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use idgate_core::config::{Config, SessionBackend, database_path, load_config};
use idgate_core::tracing_init::init_tracing;
use idgate_core::{Clock, SystemClock};
use idgate_identity::auth::Argon2Hasher;
use idgate_identity::service::{AccountService, TokenService};
use idgate_identity::session::{SessionStore, SqliteSessionStore};
use idgate_identity::storage::{
    ApplicationRepository, IdentityDatabase, IdentityStore, SecondFactorRepository,
};
use idgate_identity::tenant::{Tenant, TenantScope};

#[derive(Parser, Debug)]
#[command(name = "idgate-admin", version, about = "idgate identity administration")]
struct Cli {
    /// Path to a JSON config file (falls back to `IDGATE_CONFIG`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database if needed and apply schema migrations
    Migrate,
    /// Register a tenant application
    CreateApp {
        #[arg(long)]
        slug: String,
        #[arg(long)]
        name: String,
    },
    /// Revoke every refresh session of a user
    RevokeUser {
        /// Application id or slug.
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
    },
    /// Block a user and revoke their sessions
    DeactivateUser {
        /// Application id or slug.
        #[arg(long)]
        app: String,
        #[arg(long)]
        user: String,
    },
    /// Delete expired sessions, revocation entries and redeemed second-factor logins
    Purge,
    /// Validate the effective configuration and print it without secrets
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.log_level, cli.log_json)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting idgate-admin");

    match cli.command {
        Command::CheckConfig => {
            config.validate()?;
            report(&serde_json::to_string_pretty(&config)?);
        }
        Command::Migrate => {
            let db = open_database(&config).await?;
            db.close().await;
            report("migrations applied");
        }
        Command::CreateApp { slug, name } => {
            let db = open_database(&config).await?;
            let app = db
                .create_application(&slug, &name)
                .await
                .with_context(|| format!("creating application {slug}"))?;
            db.close().await;
            info!(app_id = %app.id, slug = %app.slug, "Application created");
            report(&app.id);
        }
        Command::RevokeUser { app, user } => {
            let admin = Admin::open(&config).await?;
            let tenant = admin.tenant(&app).await?;
            let revoked = admin.tokens.revoke_all(&tenant, &user).await?;
            admin.close().await;
            report(&format!("revoked {revoked} session(s)"));
        }
        Command::DeactivateUser { app, user } => {
            let admin = Admin::open(&config).await?;
            let tenant = admin.tenant(&app).await?;
            let hasher = Argon2Hasher::new(&config.password)
                .map_err(|e| anyhow::anyhow!("invalid password hashing parameters: {e}"))?;
            let accounts = AccountService::new(
                admin.store(),
                Arc::new(hasher),
                Arc::clone(&admin.tokens),
                admin.deadline,
            )?;
            let revoked = accounts.deactivate(&tenant, &user).await?;
            admin.close().await;
            report(&format!("deactivated, revoked {revoked} session(s)"));
        }
        Command::Purge => {
            let admin = Admin::open(&config).await?;
            let purged = admin.tokens.purge_expired().await?;
            let challenges = admin.db.purge_completed_challenges(admin.db.now()).await?;
            admin.close().await;
            report(&format!(
                "purged {purged} expired entries, {challenges} second-factor challenge(s)"
            ));
        }
    }

    Ok(())
}

/// Services for commands that touch sessions.
struct Admin {
    db: IdentityDatabase,
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<TokenService>,
    deadline: Duration,
}

impl Admin {
    async fn open(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        if config.storage.session_backend == SessionBackend::Memory {
            bail!("session backend is 'memory': sessions live in the serving process");
        }

        let db = open_database(config).await?;
        let sessions: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(db.pool().clone()));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tokens = Arc::new(TokenService::from_config(config, Arc::clone(&sessions), clock)?);

        Ok(Self {
            db,
            sessions,
            tokens,
            deadline: Duration::from_millis(config.storage.store_deadline_ms),
        })
    }

    fn store(&self) -> Arc<dyn IdentityStore> {
        Arc::new(self.db.clone())
    }

    async fn tenant(&self, identifier: &str) -> anyhow::Result<Tenant> {
        let scope = TenantScope::new(self.store(), self.deadline);
        scope
            .resolve(identifier)
            .await
            .with_context(|| format!("resolving application {identifier}"))
    }

    async fn close(self) {
        self.sessions.close().await;
        self.db.close().await;
    }
}

async fn open_database(config: &Config) -> anyhow::Result<IdentityDatabase> {
    let path = config
        .storage
        .database_path
        .clone()
        .or_else(database_path)
        .context("Cannot determine database path; set IDGATE_DATABASE_PATH")?;
    info!(path = %path.display(), "Opening identity database");
    Ok(IdentityDatabase::open(&path).await?)
}

#[allow(clippy::print_stdout)]
fn report(line: &str) {
    println!("{line}");
}
