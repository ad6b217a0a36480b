//! Tests for `TokenService`.

use std::sync::Arc;

use async_trait::async_trait;
use idgate_core::{Clock, ManualClock};
use idgate_core::config::{Config, ReplayPolicy};
use idgate_core::db::DatabaseError;

use super::tokens::{TokenService, TokenSettings};
use crate::auth::{JwtSigner, TokenSigner, TokenType};
use crate::error::{IdentityError, TokenError};
use crate::session::{
    MemorySessionStore, RevocationEntry, RevocationReason, RotateOutcome, SessionRecord,
    SessionStore,
};
use crate::tenant::Tenant;

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef-test";
const START: i64 = 1_700_000_000;

struct Fixture {
    svc: Arc<TokenService>,
    clock: Arc<ManualClock>,
    tenant: Tenant,
}

fn setup_with(policy: ReplayPolicy) -> Fixture {
    let clock = Arc::new(ManualClock::new(START));
    let settings = TokenSettings {
        replay_policy: policy,
        ..TokenSettings::default()
    };
    let svc = TokenService::new(
        Arc::new(JwtSigner::new(SECRET).unwrap()),
        Arc::new(MemorySessionStore::new()),
        Arc::clone(&clock) as Arc<dyn Clock>,
        settings,
    );
    Fixture {
        svc: Arc::new(svc),
        clock,
        tenant: Tenant::new("app-a", "a"),
    }
}

fn setup() -> Fixture {
    setup_with(ReplayPolicy::RevokeFamily)
}

fn token_error(result: Result<impl std::fmt::Debug, IdentityError>) -> TokenError {
    match result {
        Err(IdentityError::Token(e)) => e,
        other => panic!("expected token error, got {other:?}"),
    }
}

#[tokio::test]
async fn pair_carries_tenant_and_default_lifetimes() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();

    let access = f.svc.validate_access(&f.tenant, &pair.access_token).unwrap();
    assert_eq!(access.app_id, "app-a");
    assert_eq!(access.user_id, "alice");
    assert_eq!(access.exp - access.iat, 15 * 60);
    assert!(access.token_id.is_none());

    let refresh = JwtSigner::new(SECRET).unwrap().verify(&pair.refresh_token).unwrap();
    assert_eq!(refresh.token_type, TokenType::Refresh);
    assert_eq!(refresh.app_id, "app-a");
    assert_eq!(refresh.exp - refresh.iat, 720 * 60 * 60);
    assert!(refresh.token_id.is_some());
    assert_eq!(pair.refresh_expires_at, refresh.exp);
}

#[tokio::test]
async fn refresh_token_is_wrong_type_for_access() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();

    let err = token_error(f.svc.validate_access(&f.tenant, &pair.refresh_token));
    assert_eq!(err, TokenError::WrongType);
}

#[tokio::test]
async fn access_token_is_wrong_type_for_rotate() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();

    let err = token_error(f.svc.rotate(&f.tenant, &pair.access_token).await);
    assert_eq!(err, TokenError::WrongType);
}

#[tokio::test]
async fn pending_token_is_not_an_access_token() {
    let f = setup();
    let pending = f.svc.issue_pending(&f.tenant, "alice").unwrap();

    let err = token_error(f.svc.validate_access(&f.tenant, &pending));
    assert_eq!(err, TokenError::WrongType);
    let err = token_error(f.svc.rotate(&f.tenant, &pending).await);
    assert_eq!(err, TokenError::WrongType);
}

#[tokio::test]
async fn token_from_other_tenant_rejected() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    let other = Tenant::new("app-b", "b");

    assert!(matches!(
        f.svc.validate_access(&other, &pair.access_token),
        Err(IdentityError::TenantMismatch)
    ));
    assert!(matches!(
        f.svc.rotate(&other, &pair.refresh_token).await,
        Err(IdentityError::TenantMismatch)
    ));

    // Tenant is checked before expiry.
    f.clock.advance(60 * 60);
    assert!(matches!(
        f.svc.validate_access(&other, &pair.access_token),
        Err(IdentityError::TenantMismatch)
    ));
}

#[tokio::test]
async fn bad_signature_is_malformed() {
    let f = setup();
    let foreign = JwtSigner::new(b"another-secret-that-is-32-bytes-long!").unwrap();
    let forged = foreign
        .sign(&crate::auth::Claims {
            user_id: "alice".into(),
            app_id: "app-a".into(),
            token_type: TokenType::Access,
            token_id: None,
            iat: START,
            exp: START + 60,
        })
        .unwrap();

    let err = token_error(f.svc.validate_access(&f.tenant, &forged));
    assert_eq!(err, TokenError::Malformed);
    let err = token_error(f.svc.validate_access(&f.tenant, "nope"));
    assert_eq!(err, TokenError::Malformed);
}

#[tokio::test]
async fn access_token_expires_on_injected_clock() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();

    f.clock.advance(15 * 60 - 1);
    assert!(f.svc.validate_access(&f.tenant, &pair.access_token).is_ok());

    f.clock.advance(1);
    let err = token_error(f.svc.validate_access(&f.tenant, &pair.access_token));
    assert_eq!(err, TokenError::Expired);
}

#[tokio::test]
async fn rotate_replaces_refresh_token() {
    let f = setup();
    let first = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    f.clock.advance(10);

    let second = f.svc.rotate(&f.tenant, &first.refresh_token).await.unwrap();
    assert_ne!(second.refresh_token, first.refresh_token);
    assert!(f.svc.validate_access(&f.tenant, &second.access_token).is_ok());

    let third = f.svc.rotate(&f.tenant, &second.refresh_token).await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn replay_revokes_family_by_default() {
    let f = setup();
    let first = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    let second = f.svc.rotate(&f.tenant, &first.refresh_token).await.unwrap();

    let err = token_error(f.svc.rotate(&f.tenant, &first.refresh_token).await);
    assert_eq!(err, TokenError::Superseded);

    let err = token_error(f.svc.rotate(&f.tenant, &second.refresh_token).await);
    assert_eq!(err, TokenError::Revoked);
}

#[tokio::test]
async fn replay_revokes_only_its_own_family() {
    let f = setup();
    let phone = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    let laptop = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    f.svc.rotate(&f.tenant, &phone.refresh_token).await.unwrap();

    assert!(f.svc.rotate(&f.tenant, &phone.refresh_token).await.is_err());
    assert!(f.svc.rotate(&f.tenant, &laptop.refresh_token).await.is_ok());
}

#[tokio::test]
async fn reject_only_policy_keeps_successor() {
    let f = setup_with(ReplayPolicy::RejectOnly);
    let first = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    let second = f.svc.rotate(&f.tenant, &first.refresh_token).await.unwrap();

    let err = token_error(f.svc.rotate(&f.tenant, &first.refresh_token).await);
    assert_eq!(err, TokenError::Superseded);

    assert!(f.svc.rotate(&f.tenant, &second.refresh_token).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotation_has_exactly_one_winner() {
    let f = setup_with(ReplayPolicy::RejectOnly);
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let svc = Arc::clone(&f.svc);
        let tenant = f.tenant.clone();
        let token = pair.refresh_token.clone();
        handles.push(tokio::spawn(async move { svc.rotate(&tenant, &token).await }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(pair) => winners.push(pair),
            Err(IdentityError::Token(TokenError::Superseded | TokenError::Revoked)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert!(f.svc.rotate(&f.tenant, &winners[0].refresh_token).await.is_ok());
}

#[tokio::test]
async fn logout_revokes_and_is_idempotent() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();

    f.svc.revoke(&f.tenant, &pair.refresh_token).await.unwrap();
    f.svc.revoke(&f.tenant, &pair.refresh_token).await.unwrap();

    let err = token_error(f.svc.rotate(&f.tenant, &pair.refresh_token).await);
    assert_eq!(err, TokenError::Revoked);
}

#[tokio::test]
async fn logout_with_expired_token_succeeds() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    f.clock.advance(721 * 60 * 60);

    assert!(f.svc.revoke(&f.tenant, &pair.refresh_token).await.is_ok());
}

#[tokio::test]
async fn revoke_all_ends_every_session() {
    let f = setup();
    let a = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    let b = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    let bob = f.svc.issue_pair(&f.tenant, "bob").await.unwrap();

    assert_eq!(f.svc.revoke_all(&f.tenant, "alice").await.unwrap(), 2);

    assert!(f.svc.rotate(&f.tenant, &a.refresh_token).await.is_err());
    assert!(f.svc.rotate(&f.tenant, &b.refresh_token).await.is_err());
    assert!(f.svc.rotate(&f.tenant, &bob.refresh_token).await.is_ok());
}

#[test]
fn pending_token_carries_its_own_id() {
    let f = setup();
    let pending = f.svc.issue_pending(&f.tenant, "alice").unwrap();

    let claims = f.svc.validate_pending(&f.tenant, &pending).unwrap();
    assert_eq!(claims.token_type, TokenType::PendingTwoFactor);
    assert_eq!(claims.exp - claims.iat, 5 * 60);
    assert!(claims.token_id.is_some());

    let other = f.svc.issue_pending(&f.tenant, "alice").unwrap();
    let other = f.svc.validate_pending(&f.tenant, &other).unwrap();
    assert_ne!(claims.token_id, other.token_id);
}

#[tokio::test]
async fn discarded_pair_cannot_rotate() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();

    f.svc.discard_pair(&f.tenant, &pair).await;

    let err = token_error(f.svc.rotate(&f.tenant, &pair.refresh_token).await);
    assert_eq!(err, TokenError::Revoked);
}

#[tokio::test]
async fn pending_token_expires() {
    let f = setup();
    let pending = f.svc.issue_pending(&f.tenant, "alice").unwrap();
    f.clock.advance(5 * 60);

    let err = token_error(f.svc.validate_pending(&f.tenant, &pending));
    assert_eq!(err, TokenError::Expired);
}

#[tokio::test]
async fn purge_drops_expired_sessions() {
    let f = setup();
    let pair = f.svc.issue_pair(&f.tenant, "alice").await.unwrap();
    f.svc.rotate(&f.tenant, &pair.refresh_token).await.unwrap();

    assert_eq!(f.svc.purge_expired().await.unwrap(), 0);
    f.clock.advance(720 * 60 * 60);
    // The live successor and the rotated entry of its predecessor.
    assert_eq!(f.svc.purge_expired().await.unwrap(), 2);
}

#[test]
fn weak_signing_secret_rejected() {
    let mut config = Config::default();
    config.tokens.signing_secret = "short".into();

    let result = TokenService::from_config(
        &config,
        Arc::new(MemorySessionStore::new()),
        Arc::new(ManualClock::new(START)),
    );
    assert!(matches!(result, Err(IdentityError::Config(_))));
}

/// A store whose calls never complete.
struct StalledStore;

#[async_trait]
impl SessionStore for StalledStore {
    async fn insert(&self, _: &Tenant, _: &SessionRecord) -> Result<bool, DatabaseError> {
        std::future::pending().await
    }

    async fn get(
        &self,
        _: &Tenant,
        _: &str,
        _: i64,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        std::future::pending().await
    }

    async fn rotate(
        &self,
        _: &Tenant,
        _: &str,
        _: &SessionRecord,
        _: i64,
    ) -> Result<RotateOutcome, DatabaseError> {
        std::future::pending().await
    }

    async fn remove(&self, _: &Tenant, _: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        std::future::pending().await
    }

    async fn revoke(&self, _: &Tenant, _: &RevocationEntry, _: i64) -> Result<bool, DatabaseError> {
        std::future::pending().await
    }

    async fn revocation(
        &self,
        _: &Tenant,
        _: &str,
        _: i64,
    ) -> Result<Option<RevocationEntry>, DatabaseError> {
        std::future::pending().await
    }

    async fn revoke_family(
        &self,
        _: &Tenant,
        _: &str,
        _: RevocationReason,
        _: i64,
    ) -> Result<u64, DatabaseError> {
        std::future::pending().await
    }

    async fn revoke_user(
        &self,
        _: &Tenant,
        _: &str,
        _: RevocationReason,
        _: i64,
    ) -> Result<u64, DatabaseError> {
        std::future::pending().await
    }

    async fn purge_expired(&self, _: i64) -> Result<u64, DatabaseError> {
        std::future::pending().await
    }

    async fn close(&self) {}
}

#[tokio::test(start_paused = true)]
async fn stalled_store_surfaces_unavailable() {
    let svc = TokenService::new(
        Arc::new(JwtSigner::new(SECRET).unwrap()),
        Arc::new(StalledStore),
        Arc::new(ManualClock::new(START)),
        TokenSettings::default(),
    );

    let err = svc.issue_pair(&Tenant::new("app-a", "a"), "alice").await.unwrap_err();
    assert!(matches!(err, IdentityError::Unavailable));
    assert!(err.is_retryable());
}
