#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use super::*;
use crate::storage::IdentityDatabase;

const NOW: i64 = 1_700_000_000;

fn tenant() -> Tenant {
    Tenant::new("app-1", "one")
}

fn record(token_id: &str, family_id: &str, user_id: &str) -> SessionRecord {
    SessionRecord {
        token_id: token_id.into(),
        family_id: family_id.into(),
        user_id: user_id.into(),
        app_id: "app-1".into(),
        issued_at: NOW,
        expires_at: NOW + 3600,
    }
}

async fn stores() -> Vec<(&'static str, Arc<dyn SessionStore>)> {
    let db = IdentityDatabase::open_in_memory().await.unwrap();
    vec![
        ("memory", Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>),
        ("sqlite", Arc::new(SqliteSessionStore::new(db.pool().clone()))),
    ]
}

#[tokio::test]
async fn insert_is_set_if_absent() {
    for (name, store) in stores().await {
        let t = tenant();
        assert!(store.insert(&t, &record("t1", "f1", "u1")).await.unwrap(), "{name}");
        assert!(!store.insert(&t, &record("t1", "f2", "u2")).await.unwrap(), "{name}");

        let got = store.get(&t, "t1", NOW).await.unwrap().unwrap();
        assert_eq!(got.family_id, "f1", "{name}");
    }
}

#[tokio::test]
async fn sessions_are_tenant_scoped() {
    for (name, store) in stores().await {
        let t = tenant();
        let other = Tenant::new("app-2", "two");
        store.insert(&t, &record("t1", "f1", "u1")).await.unwrap();

        assert!(store.get(&other, "t1", NOW).await.unwrap().is_none(), "{name}");
        assert!(store.remove(&other, "t1").await.unwrap().is_none(), "{name}");
        assert!(store.get(&t, "t1", NOW).await.unwrap().is_some(), "{name}");
    }
}

#[tokio::test]
async fn expired_session_not_returned() {
    for (name, store) in stores().await {
        let t = tenant();
        store.insert(&t, &record("t1", "f1", "u1")).await.unwrap();
        assert!(store.get(&t, "t1", NOW + 3600).await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn rotate_replaces_and_marks_rotated() {
    for (name, store) in stores().await {
        let t = tenant();
        store.insert(&t, &record("t1", "f1", "u1")).await.unwrap();

        let outcome = store.rotate(&t, "t1", &record("t2", "f1", "u1"), NOW).await.unwrap();
        assert!(
            matches!(outcome, RotateOutcome::Rotated(ref prev) if prev.token_id == "t1"),
            "{name}"
        );

        assert!(store.get(&t, "t1", NOW).await.unwrap().is_none(), "{name}");
        assert!(store.get(&t, "t2", NOW).await.unwrap().is_some(), "{name}");

        let entry = store.revocation(&t, "t1", NOW).await.unwrap().unwrap();
        assert_eq!(entry.reason, RevocationReason::Rotated, "{name}");
        assert_eq!(entry.family_id.as_deref(), Some("f1"), "{name}");

        let again = store.rotate(&t, "t1", &record("t3", "f1", "u1"), NOW).await.unwrap();
        assert!(
            matches!(again, RotateOutcome::Revoked(ref e) if e.reason == RevocationReason::Rotated),
            "{name}"
        );
        assert!(store.get(&t, "t3", NOW).await.unwrap().is_none(), "{name}");
    }
}

#[tokio::test]
async fn rotate_unknown_token_is_missing() {
    for (name, store) in stores().await {
        let outcome = store
            .rotate(&tenant(), "ghost", &record("t2", "f1", "u1"), NOW)
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Missing, "{name}");
    }
}

#[tokio::test]
async fn concurrent_rotate_has_one_winner() {
    for (name, store) in stores().await {
        let t = tenant();
        store.insert(&t, &record("t1", "f1", "u1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                let successor = record(&format!("next-{i}"), "f1", "u1");
                store.rotate(&t, "t1", &successor, NOW).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), RotateOutcome::Rotated(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "{name}");
    }
}

#[tokio::test]
async fn revoke_is_set_if_absent_until_expiry() {
    for (name, store) in stores().await {
        let t = tenant();
        let entry =
            RevocationEntry::for_session(&record("t1", "f1", "u1"), RevocationReason::Logout);

        assert!(store.revoke(&t, &entry, NOW).await.unwrap(), "{name}");
        assert!(!store.revoke(&t, &entry, NOW).await.unwrap(), "{name}");

        // Past expiry the entry is gone and may be written again.
        assert!(store.revocation(&t, "t1", NOW + 3600).await.unwrap().is_none(), "{name}");
        assert!(store.revoke(&t, &entry, NOW + 3600).await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn revoke_family_leaves_other_families() {
    for (name, store) in stores().await {
        let t = tenant();
        store.insert(&t, &record("a1", "fa", "u1")).await.unwrap();
        store.insert(&t, &record("a2", "fa", "u1")).await.unwrap();
        store.insert(&t, &record("b1", "fb", "u1")).await.unwrap();

        let n = store.revoke_family(&t, "fa", RevocationReason::Replay, NOW).await.unwrap();
        assert_eq!(n, 2, "{name}");

        assert!(store.get(&t, "a1", NOW).await.unwrap().is_none(), "{name}");
        assert!(store.get(&t, "b1", NOW).await.unwrap().is_some(), "{name}");
        let entry = store.revocation(&t, "a2", NOW).await.unwrap().unwrap();
        assert_eq!(entry.reason, RevocationReason::Replay, "{name}");
    }
}

#[tokio::test]
async fn revoke_user_stays_in_tenant() {
    for (name, store) in stores().await {
        let t = tenant();
        let other = Tenant::new("app-2", "two");
        store.insert(&t, &record("a1", "fa", "u1")).await.unwrap();
        store.insert(&t, &record("b1", "fb", "u1")).await.unwrap();
        let mut foreign = record("c1", "fc", "u1");
        foreign.app_id = "app-2".into();
        store.insert(&other, &foreign).await.unwrap();

        let n = store.revoke_user(&t, "u1", RevocationReason::Admin, NOW).await.unwrap();
        assert_eq!(n, 2, "{name}");
        assert!(store.get(&other, "c1", NOW).await.unwrap().is_some(), "{name}");
    }
}

#[tokio::test]
async fn purge_drops_only_expired() {
    for (name, store) in stores().await {
        let t = tenant();
        let mut short = record("short", "f1", "u1");
        short.expires_at = NOW + 10;
        store.insert(&t, &short).await.unwrap();
        store.insert(&t, &record("long", "f2", "u1")).await.unwrap();
        store
            .revoke(&t, &RevocationEntry::for_session(&short, RevocationReason::Logout), NOW)
            .await
            .unwrap();

        let purged = store.purge_expired(NOW + 10).await.unwrap();
        assert_eq!(purged, 2, "{name}");
        assert!(store.get(&t, "long", NOW).await.unwrap().is_some(), "{name}");
    }
}

#[tokio::test]
async fn closed_store_rejects_calls() {
    for (name, store) in stores().await {
        store.close().await;
        assert!(store.get(&tenant(), "t1", NOW).await.is_err(), "{name}");
    }
}
