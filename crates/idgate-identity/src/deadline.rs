//! Deadlines for collaborator calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{IdentityError, Result};

/// Run `fut` with a deadline. Expiry drops the future, which rolls back any
/// open transaction, and surfaces as `Unavailable`.
pub(crate) async fn with_deadline<T, E, F>(
    limit: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<IdentityError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            warn!(operation, timeout_ms = limit.as_millis(), "Deadline exceeded");
            Err(IdentityError::Unavailable)
        }
    }
}
