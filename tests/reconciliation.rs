//! Reconciliation against a seeded store on the system clock.

use chrono::{Duration as ChronoDuration, Utc};
use modwarden::{
    Clock, EntitlementStore, MemoryStore, ModBundle, ModSet, Purchase, Reconciler,
    ReconciliationWorker, Server, SessionLifetimes, Subscription, SystemClock, User, WorkerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SERVER: i64 = 40;
const OWNER: i64 = 4;

async fn seeded() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();

    let mut owner = User::new(OWNER, "owner");
    owner.claimed_mods = ModSet::from([100, 200]);
    owner.balance = 500;
    store.insert_user(owner).await;

    store
        .insert_server(Server {
            id: SERVER,
            owner_id: OWNER,
            name: "community".to_string(),
            ip: "192.0.2.10".to_string(),
            granted_mods: ModSet::from([100, 200]),
        })
        .await;

    for (id, mod_id, expires_at) in [
        (1, 100, now - ChronoDuration::days(1)),
        (2, 200, now + ChronoDuration::days(10)),
    ] {
        store
            .insert_purchase(Purchase {
                id,
                buyer_user_id: OWNER,
                mod_id,
                server_id: SERVER,
                purchased_at: now - ChronoDuration::days(30),
                expires_at,
            })
            .await;
    }

    store
}

fn reconciler(store: Arc<MemoryStore>) -> Arc<Reconciler> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    Arc::new(Reconciler::new(
        store,
        clock,
        WorkerConfig {
            retry_backoff: Duration::from_millis(1),
            ..WorkerConfig::default()
        },
        SessionLifetimes::default(),
    ))
}

#[tokio::test]
async fn expired_purchase_leaves_server_and_user() {
    let store = seeded().await;
    let report = reconciler(store.clone()).sweep().await.unwrap();
    assert_eq!(report.grants_revoked, 1);

    let server = store.server_by_id(SERVER).await.unwrap().unwrap();
    assert!(!server.granted_mods.contains(100));
    assert!(server.granted_mods.contains(200));

    let user = store.user_by_id(OWNER).await.unwrap().unwrap();
    assert!(!user.claimed_mods.contains(100));
    assert!(user.claimed_mods.contains(200));
}

#[tokio::test]
async fn subscriptions_expire_or_renew() {
    let store = seeded().await;
    let now = Utc::now();
    let bundle_mods = ModSet::from([7, 8, 9]);

    store
        .insert_bundle(ModBundle {
            id: 1,
            developer: "studio".to_string(),
            covered_mods: bundle_mods.clone(),
            price: 120,
        })
        .await;
    store
        .insert_subscription(Subscription {
            id: 1,
            identity: "owner".to_string(),
            steam_id: String::new(),
            covered_mods: bundle_mods.clone(),
            active: true,
            auto_renew: true,
            expires_at: now - ChronoDuration::hours(1),
        })
        .await;
    store
        .insert_subscription(Subscription {
            id: 2,
            identity: "owner".to_string(),
            steam_id: String::new(),
            covered_mods: ModSet::from([1]),
            active: true,
            auto_renew: false,
            expires_at: now - ChronoDuration::hours(1),
        })
        .await;

    let report = reconciler(store.clone()).sweep().await.unwrap();
    assert_eq!(report.subscriptions_renewed, 1);
    assert_eq!(report.subscriptions_expired, 1);

    let owner = store.user_by_id(OWNER).await.unwrap().unwrap();
    assert_eq!(owner.balance, 380);
    assert!(store.subscription_by_id(1).await.unwrap().unwrap().active);
    assert!(!store.subscription_by_id(2).await.unwrap().unwrap().active);
}

#[tokio::test]
async fn worker_sweeps_and_shuts_down() {
    let store = seeded().await;
    let shutdown = CancellationToken::new();
    let handle = ReconciliationWorker::spawn(
        reconciler(store.clone()),
        Duration::from_secs(3600),
        shutdown.clone(),
    );

    let mut revoked = false;
    for _ in 0..100 {
        let server = store.server_by_id(SERVER).await.unwrap().unwrap();
        if !server.granted_mods.contains(100) {
            revoked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(revoked);

    shutdown.cancel();
    let sweeps = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stops promptly")
        .unwrap();
    assert_eq!(sweeps, 1);
}
