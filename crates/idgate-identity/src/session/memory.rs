//! In-process session store.

use std::collections::HashMap;

use async_trait::async_trait;
use idgate_core::db::DatabaseError;
use tokio::sync::Mutex;
use tracing::debug;

use super::{RevocationEntry, RevocationReason, RotateOutcome, SessionRecord, SessionStore};
use crate::tenant::Tenant;

type Key = (String, String);

fn key(tenant: &Tenant, token_id: &str) -> Key {
    (tenant.app_id().to_owned(), token_id.to_owned())
}

fn scoped(tenant: &Tenant, record: &SessionRecord) -> SessionRecord {
    SessionRecord {
        app_id: tenant.app_id().to_owned(),
        ..record.clone()
    }
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<Key, SessionRecord>,
    revocations: HashMap<Key, RevocationEntry>,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> Result<(), DatabaseError> {
        if self.closed {
            Err(DatabaseError::Closed)
        } else {
            Ok(())
        }
    }

    fn live_revocation(&self, key: &Key, now: i64) -> Option<&RevocationEntry> {
        self.revocations.get(key).filter(|e| e.expires_at > now)
    }

    fn add_revocation(&mut self, entry: RevocationEntry, now: i64) -> bool {
        let key = (entry.app_id.clone(), entry.token_id.clone());
        if self.live_revocation(&key, now).is_some() {
            return false;
        }
        self.revocations.insert(key, entry);
        true
    }

    /// Remove every session in `app_id` matching `pred` and revoke it.
    fn revoke_where(
        &mut self,
        app_id: &str,
        reason: RevocationReason,
        now: i64,
        pred: impl Fn(&SessionRecord) -> bool,
    ) -> u64 {
        let keys: Vec<Key> = self
            .sessions
            .iter()
            .filter(|((app, _), record)| app == app_id && pred(record))
            .map(|(k, _)| k.clone())
            .collect();

        let mut count = 0;
        for k in keys {
            if let Some(record) = self.sessions.remove(&k) {
                if record.expires_at > now {
                    count += 1;
                }
                self.add_revocation(RevocationEntry::for_session(&record, reason), now);
            }
        }
        count
    }
}

/// Session store backed by process memory.
///
/// All state sits behind one mutex that is never held across an await
/// point, so each operation is a single critical section.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, tenant: &Tenant, record: &SessionRecord) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;

        let k = key(tenant, &record.token_id);
        if inner.sessions.contains_key(&k) {
            return Ok(false);
        }
        inner.sessions.insert(k, scoped(tenant, record));
        Ok(true)
    }

    async fn get(
        &self,
        tenant: &Tenant,
        token_id: &str,
        now: i64,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;

        Ok(inner
            .sessions
            .get(&key(tenant, token_id))
            .filter(|r| r.expires_at > now)
            .cloned())
    }

    async fn rotate(
        &self,
        tenant: &Tenant,
        old_token_id: &str,
        successor: &SessionRecord,
        now: i64,
    ) -> Result<RotateOutcome, DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;

        let old_key = key(tenant, old_token_id);
        let new_key = key(tenant, &successor.token_id);
        if inner.sessions.contains_key(&new_key) {
            return Err(DatabaseError::Conflict(format!(
                "session {} already exists",
                successor.token_id
            )));
        }

        let Some(previous) = inner.sessions.remove(&old_key) else {
            return Ok(inner
                .live_revocation(&old_key, now)
                .cloned()
                .map_or(RotateOutcome::Missing, RotateOutcome::Revoked));
        };
        inner.sessions.insert(new_key, scoped(tenant, successor));
        inner.add_revocation(
            RevocationEntry::for_session(&previous, RevocationReason::Rotated),
            now,
        );
        Ok(RotateOutcome::Rotated(previous))
    }

    async fn remove(
        &self,
        tenant: &Tenant,
        token_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner.sessions.remove(&key(tenant, token_id)))
    }

    async fn revoke(
        &self,
        tenant: &Tenant,
        entry: &RevocationEntry,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;

        let entry = RevocationEntry {
            app_id: tenant.app_id().to_owned(),
            ..entry.clone()
        };
        Ok(inner.add_revocation(entry, now))
    }

    async fn revocation(
        &self,
        tenant: &Tenant,
        token_id: &str,
        now: i64,
    ) -> Result<Option<RevocationEntry>, DatabaseError> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner.live_revocation(&key(tenant, token_id), now).cloned())
    }

    async fn revoke_family(
        &self,
        tenant: &Tenant,
        family_id: &str,
        reason: RevocationReason,
        now: i64,
    ) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner.revoke_where(tenant.app_id(), reason, now, |r| r.family_id == family_id))
    }

    async fn revoke_user(
        &self,
        tenant: &Tenant,
        user_id: &str,
        reason: RevocationReason,
        now: i64,
    ) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner.revoke_where(tenant.app_id(), reason, now, |r| r.user_id == user_id))
    }

    async fn purge_expired(&self, now: i64) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;

        let before = inner.sessions.len() + inner.revocations.len();
        inner.sessions.retain(|_, r| r.expires_at > now);
        inner.revocations.retain(|_, e| e.expires_at > now);
        let purged = before - inner.sessions.len() - inner.revocations.len();

        debug!(purged, "Purged expired session state");
        Ok(u64::try_from(purged).unwrap_or(u64::MAX))
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.sessions.clear();
        inner.revocations.clear();
        inner.closed = true;
    }
}
