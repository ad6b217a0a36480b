//! Tenant scoping.
//!
//! A [`Tenant`] can only be obtained from [`TenantScope::resolve`], and every
//! repository and session-store call takes one, so all lookups are filtered
//! by the resolved `app_id`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::deadline::with_deadline;
use crate::error::{IdentityError, Result};
use crate::storage::{Application, IdentityStore};

/// The resolved application context of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    app_id: String,
    slug: String,
}

impl Tenant {
    pub(crate) fn new(app_id: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            slug: slug.into(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }
}

impl From<&Application> for Tenant {
    fn from(app: &Application) -> Self {
        Self::new(&app.id, &app.slug)
    }
}

/// Resolves tenant identifiers and checks token/request agreement.
#[derive(Clone)]
pub struct TenantScope {
    store: Arc<dyn IdentityStore>,
    deadline: Duration,
}

impl TenantScope {
    pub fn new(store: Arc<dyn IdentityStore>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    /// Resolve an application id or slug. Unknown and inactive applications
    /// are both `TenantNotFound`.
    #[instrument(skip(self))]
    pub async fn resolve(&self, identifier: &str) -> Result<Tenant> {
        let app = with_deadline(
            self.deadline,
            "resolve_tenant",
            self.store.find_application(identifier),
        )
        .await?;

        match app {
            Some(app) if app.active => Ok(Tenant::from(&app)),
            _ => Err(IdentityError::TenantNotFound),
        }
    }

    /// Reject a token whose `app_id` claim is not the request's tenant.
    pub fn authorize(claimed_app_id: &str, tenant: &Tenant) -> Result<()> {
        if claimed_app_id == tenant.app_id() {
            Ok(())
        } else {
            warn!(
                claimed_app_id,
                request_app_id = tenant.app_id(),
                "Token presented under another tenant"
            );
            Err(IdentityError::TenantMismatch)
        }
    }
}
