//! Gateway walkthrough against an in-memory store.
//!
//! Logs in a user, sends guarded requests until the identity limiter
//! blocks, tries an admin path, and runs one reconciliation sweep in the
//! background worker.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=modwarden=debug cargo run --example gateway_demo
//! ```

use chrono::{Duration as ChronoDuration, Utc};
use modwarden::{
    Clock, GateDecision, Gateway, InboundRequest, LoginService, MemoryStore, ModSet,
    ModwardenConfig, ModwardenError, PasswordHasher, Purchase, Reconciler, ReconciliationWorker,
    Server, Sha256Hasher, SystemClock, TokenIssuer, User,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ModwardenError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modwarden=info")),
        )
        .init();

    let config = ModwardenConfig::default();
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    seed(&store).await;

    let issuer = Arc::new(TokenIssuer::new(
        store.clone(),
        Arc::clone(&clock),
        config.sessions.clone(),
        config.tokens.clone(),
    ));
    let login = LoginService::new(store.clone(), issuer, Arc::new(Sha256Hasher));
    let gateway = Gateway::with_clock(&config, store.clone(), Arc::clone(&clock))?;

    let session = login.login("alice", "hunter2", "203.0.113.5").await?;
    println!("alice logged in, session until {}", session.expires_at);

    for i in 1..=config.gate.identity_limit.max_requests + 1 {
        let request = InboundRequest::new("/api/servers/mine", "203.0.113.5")
            .with_credentials(&session.token, "alice");
        match gateway.handle(request).await {
            GateDecision::Forward(admitted) => {
                println!("#{:02} forwarded for {:?}", i, admitted.identity)
            }
            GateDecision::Respond(resp) => println!(
                "#{:02} {} {} (retry after {:?}s)",
                i, resp.status, resp.body, resp.retry_after_secs
            ),
        }
    }

    let admin = InboundRequest::new("/api/admin/users", "203.0.113.6")
        .with_credentials(&session.token, "alice");
    if let GateDecision::Respond(resp) = gateway.handle(admin).await {
        println!("admin path as alice: {} {}", resp.status, resp.body);
    }

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        clock,
        config.worker.clone(),
        config.sessions.clone(),
    ));
    let shutdown = CancellationToken::new();
    let worker = ReconciliationWorker::spawn(reconciler, config.worker.interval, shutdown.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    let sweeps = worker
        .await
        .map_err(|e| ModwardenError::StoreUnavailable(e.to_string()))?;
    println!("worker completed {} sweep(s)", sweeps);

    Ok(())
}

async fn seed(store: &MemoryStore) {
    let now = Utc::now();

    let mut alice = User::new(1, "alice");
    alice.password_hash = Sha256Hasher.hash("hunter2");
    alice.claimed_mods = ModSet::from([11, 12]);
    store.insert_user(alice).await;

    store
        .insert_server(Server {
            id: 1,
            owner_id: 1,
            name: "alice-survival".to_string(),
            ip: "198.51.100.20".to_string(),
            granted_mods: ModSet::from([11, 12]),
        })
        .await;

    store
        .insert_purchase(Purchase {
            id: 1,
            buyer_user_id: 1,
            mod_id: 11,
            server_id: 1,
            purchased_at: now - ChronoDuration::days(40),
            expires_at: now - ChronoDuration::days(10),
        })
        .await;
    store
        .insert_purchase(Purchase {
            id: 2,
            buyer_user_id: 1,
            mod_id: 12,
            server_id: 1,
            purchased_at: now - ChronoDuration::days(5),
            expires_at: now + ChronoDuration::days(25),
        })
        .await;
}
