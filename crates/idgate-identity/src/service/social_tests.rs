//! Tests for `SocialIdentityResolver`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use idgate_core::{Clock, ManualClock};

use super::social::{SocialIdentityResolver, SocialSettings};
use super::tokens::{TokenService, TokenSettings};
use crate::auth::JwtSigner;
use crate::error::{IdentityError, SocialProviderError};
use crate::session::MemorySessionStore;
use crate::social::{ProviderProfile, SocialProvider};
use crate::storage::{
    ApplicationRepository, IdentityDatabase, NewUser, Profile, SocialAccountRepository,
    UserRepository,
};
use crate::tenant::Tenant;

const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef-test";

struct FakeProvider {
    profile: ProviderProfile,
    delay: Duration,
}

#[async_trait]
impl SocialProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn exchange(&self, code: &str) -> Result<ProviderProfile, SocialProviderError> {
        tokio::time::sleep(self.delay).await;
        if code == "bad" {
            return Err(SocialProviderError::Exchange { retryable: false });
        }
        Ok(self.profile.clone())
    }
}

struct Fixture {
    resolver: Arc<SocialIdentityResolver>,
    tokens: Arc<TokenService>,
    db: IdentityDatabase,
    tenant: Tenant,
}

async fn setup_with(settings: SocialSettings, provider_delay: Duration) -> Fixture {
    let db = IdentityDatabase::open_in_memory().await.unwrap();
    let app = db.create_application("acme", "Acme").await.unwrap();
    let tenant = Tenant::from(&app);

    let tokens = Arc::new(TokenService::new(
        Arc::new(JwtSigner::new(SECRET).unwrap()),
        Arc::new(MemorySessionStore::new()),
        Arc::new(ManualClock::new(1_700_000_000)) as Arc<dyn Clock>,
        TokenSettings::default(),
    ));
    let provider = FakeProvider {
        profile: google("g-1", "alice@example.com"),
        delay: provider_delay,
    };
    let resolver = SocialIdentityResolver::new(Arc::new(db.clone()), Arc::clone(&tokens), settings)
        .with_provider(Arc::new(provider));

    Fixture {
        resolver: Arc::new(resolver),
        tokens,
        db,
        tenant,
    }
}

async fn setup() -> Fixture {
    setup_with(SocialSettings::default(), Duration::ZERO).await
}

fn google(id: &str, email: &str) -> ProviderProfile {
    ProviderProfile {
        provider_user_id: id.into(),
        email: Some(email.into()),
        email_verified: true,
        name: Some("Alice".into()),
        locale: Some("en".into()),
        avatar_url: None,
        access_token: Some("ya29.token".into()),
    }
}

async fn local_user(f: &Fixture, email: &str, name: Option<&str>) -> String {
    f.db.create_user(
        &f.tenant,
        &NewUser {
            email: email.into(),
            password_hash: Some("$argon2id$placeholder".into()),
            email_verified: false,
            profile: Profile {
                name: name.map(Into::into),
                ..Profile::default()
            },
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn first_login_creates_user_and_account() {
    let f = setup().await;
    let (user, is_new) = f
        .resolver
        .resolve_or_create(&f.tenant, "google", &google("g-1", "Alice@Example.com"))
        .await
        .unwrap();

    assert!(is_new);
    assert_eq!(user.email, "alice@example.com");
    assert!(user.email_verified);
    assert!(user.password_hash.is_none());
    assert_eq!(user.name.as_deref(), Some("Alice"));

    let account = f.db.find_social_account(&f.tenant, "google", "g-1").await.unwrap().unwrap();
    assert_eq!(account.user_id, user.id);
    assert_eq!(account.access_token.as_deref(), Some("ya29.token"));
}

#[tokio::test]
async fn repeated_resolution_is_idempotent() {
    let f = setup().await;
    let profile = google("g-1", "alice@example.com");

    let (first, _) = f.resolver.resolve_or_create(&f.tenant, "google", &profile).await.unwrap();
    let (second, is_new) =
        f.resolver.resolve_or_create(&f.tenant, "google", &profile).await.unwrap();

    assert!(!is_new);
    assert_eq!(first.id, second.id);
    let accounts = f.db.list_social_accounts(&f.tenant, &first.id).await.unwrap();
    assert_eq!(accounts.len(), 1);
}

#[tokio::test]
async fn links_existing_user_without_overwriting() {
    let f = setup().await;
    let user_id = local_user(&f, "alice@example.com", Some("Alice Local")).await;

    let mut profile = google("g-1", "ALICE@example.com");
    profile.avatar_url = Some("https://img.example.com/alice.png".into());
    let (user, is_new) = f.resolver.resolve_or_create(&f.tenant, "google", &profile).await.unwrap();

    assert!(!is_new);
    assert_eq!(user.id, user_id);
    assert_eq!(user.name.as_deref(), Some("Alice Local"));
    assert_eq!(user.locale.as_deref(), Some("en"));
    assert_eq!(user.avatar_url.as_deref(), Some("https://img.example.com/alice.png"));
    assert!(user.email_verified);

    let stored = f.db.get_user(&f.tenant, &user_id).await.unwrap().unwrap();
    assert_eq!(stored.profile(), user.profile());
    assert!(stored.email_verified);
    assert!(stored.password_hash.is_some());
}

#[tokio::test]
async fn unverified_provider_email_does_not_verify_local_user() {
    let f = setup().await;
    let user_id = local_user(&f, "alice@example.com", None).await;

    let mut profile = google("g-1", "alice@example.com");
    profile.email_verified = false;
    f.resolver.resolve_or_create(&f.tenant, "google", &profile).await.unwrap();

    let stored = f.db.get_user(&f.tenant, &user_id).await.unwrap().unwrap();
    assert!(!stored.email_verified);
}

#[tokio::test]
async fn sync_keeps_local_edits_of_unchanged_fields() {
    let f = setup().await;
    let profile = google("g-1", "alice@example.com");
    let (user, _) = f.resolver.resolve_or_create(&f.tenant, "google", &profile).await.unwrap();

    // The user renames themselves locally.
    let edited = Profile {
        name: Some("Ally".into()),
        ..user.profile()
    };
    f.db.update_profile(&f.tenant, &user.id, &edited).await.unwrap();

    // Provider name is unchanged, locale changed upstream.
    let mut next = profile.clone();
    next.locale = Some("fr".into());
    let (synced, _) = f.resolver.resolve_or_create(&f.tenant, "google", &next).await.unwrap();

    assert_eq!(synced.name.as_deref(), Some("Ally"));
    assert_eq!(synced.locale.as_deref(), Some("fr"));

    let stored = f.db.get_user(&f.tenant, &user.id).await.unwrap().unwrap();
    assert_eq!(stored.name.as_deref(), Some("Ally"));
    assert_eq!(stored.locale.as_deref(), Some("fr"));

    let account = f.db.find_social_account(&f.tenant, "google", "g-1").await.unwrap().unwrap();
    assert_eq!(account.locale.as_deref(), Some("fr"));
}

#[tokio::test]
async fn provider_name_change_overwrites_local_name() {
    let f = setup().await;
    let profile = google("g-1", "alice@example.com");
    f.resolver.resolve_or_create(&f.tenant, "google", &profile).await.unwrap();

    let mut renamed = profile.clone();
    renamed.name = Some("Alice Smith".into());
    let (user, _) = f.resolver.resolve_or_create(&f.tenant, "google", &renamed).await.unwrap();
    assert_eq!(user.name.as_deref(), Some("Alice Smith"));
}

#[tokio::test]
async fn missing_email_fails_before_any_write() {
    let f = setup().await;
    for email in [None, Some("not-an-email".to_string())] {
        let profile = ProviderProfile {
            email,
            ..google("g-9", "")
        };
        let err = f
            .resolver
            .resolve_or_create(&f.tenant, "google", &profile)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::SocialProvider(SocialProviderError::MissingEmail)
        ));
    }
    assert!(f.db.find_social_account(&f.tenant, "google", "g-9").await.unwrap().is_none());
}

#[tokio::test]
async fn same_identity_in_two_tenants_gives_two_users() {
    let f = setup().await;
    let other = Tenant::from(&f.db.create_application("globex", "Globex").await.unwrap());
    let profile = google("g-1", "alice@example.com");

    let (a, new_a) = f.resolver.resolve_or_create(&f.tenant, "google", &profile).await.unwrap();
    let (b, new_b) = f.resolver.resolve_or_create(&other, "google", &profile).await.unwrap();

    assert!(new_a && new_b);
    assert_ne!(a.id, b.id);
    assert_eq!(b.app_id, other.app_id());
}

#[tokio::test]
async fn concurrent_first_logins_share_one_account() {
    let f = setup().await;
    let profile = google("g-1", "alice@example.com");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let resolver = Arc::clone(&f.resolver);
        let tenant = f.tenant.clone();
        let profile = profile.clone();
        handles.push(tokio::spawn(async move {
            resolver.resolve_or_create(&tenant, "google", &profile).await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    let mut created = 0;
    for handle in handles {
        let (user, is_new) = handle.await.unwrap();
        created += usize::from(is_new);
        ids.push(user.id);
    }
    ids.dedup();

    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
    let accounts = f.db.list_social_accounts(&f.tenant, &ids[0]).await.unwrap();
    assert_eq!(accounts.len(), 1);
}

#[tokio::test]
async fn login_issues_tokens_for_the_tenant() {
    let f = setup().await;
    let login = f
        .resolver
        .login(&f.tenant, "google", &google("g-1", "alice@example.com"))
        .await
        .unwrap();

    assert!(login.is_new_account);
    let claims = f.tokens.validate_access(&f.tenant, &login.tokens.access_token).unwrap();
    assert_eq!(claims.user_id, login.user.id);
    assert_eq!(claims.app_id, f.tenant.app_id());
}

#[tokio::test]
async fn deactivated_user_cannot_log_in() {
    let f = setup().await;
    let profile = google("g-1", "alice@example.com");
    let login = f.resolver.login(&f.tenant, "google", &profile).await.unwrap();
    f.db.set_active(&f.tenant, &login.user.id, false).await.unwrap();

    let err = f.resolver.login(&f.tenant, "google", &profile).await.unwrap_err();
    assert!(matches!(err, IdentityError::Authentication));
}

#[tokio::test]
async fn login_with_code_uses_registered_provider() {
    let f = setup().await;
    let login = f.resolver.login_with_code(&f.tenant, "fake", "code-1").await.unwrap();

    let account = f.db.find_social_account(&f.tenant, "fake", "g-1").await.unwrap().unwrap();
    assert_eq!(account.user_id, login.user.id);
}

#[tokio::test]
async fn unknown_provider_is_rejected() {
    let f = setup().await;
    let err = f.resolver.login_with_code(&f.tenant, "myspace", "code").await.unwrap_err();
    assert!(matches!(
        err,
        IdentityError::SocialProvider(SocialProviderError::UnknownProvider)
    ));
}

#[tokio::test]
async fn rejected_code_is_not_retryable() {
    let f = setup().await;
    let err = f.resolver.login_with_code(&f.tenant, "fake", "bad").await.unwrap_err();
    assert!(matches!(
        err,
        IdentityError::SocialProvider(SocialProviderError::Exchange { retryable: false })
    ));
}

#[tokio::test]
async fn slow_provider_times_out_as_retryable() {
    let settings = SocialSettings {
        provider_timeout: Duration::from_millis(50),
        ..SocialSettings::default()
    };
    let f = setup_with(settings, Duration::from_secs(5)).await;

    let err = f.resolver.login_with_code(&f.tenant, "fake", "code-1").await.unwrap_err();
    assert!(matches!(
        err,
        IdentityError::SocialProvider(SocialProviderError::Exchange { retryable: true })
    ));
    assert!(err.is_retryable());
    assert!(f.db.find_social_account(&f.tenant, "fake", "g-1").await.unwrap().is_none());
}
