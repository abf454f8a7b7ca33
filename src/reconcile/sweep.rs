//! One reconciliation pass over subscriptions and purchases.
//!
//! Each row is settled as its own short unit of work. A row is re-read on
//! every attempt, so a retry after a transient failure acts on fresh state
//! and a row that was already settled is left alone.

use crate::clock::{saturating_add, Clock};
use crate::config::{SessionLifetimes, WorkerConfig};
use crate::model::{Purchase, Subscription};
use crate::store::{EntitlementStore, StoreWrite, UnitOfWork};
use crate::ModwardenError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Subscriptions marked inactive.
    pub subscriptions_expired: usize,
    /// Subscriptions charged and extended.
    pub subscriptions_renewed: usize,
    /// Auto-renewals left untouched because no bundle price was found.
    pub renewals_skipped: usize,
    /// Expired purchases whose grants were stripped.
    pub grants_revoked: usize,
    /// Rows that still failed after every retry.
    pub row_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Unchanged,
    Expired,
    Renewed,
    RenewalSkipped,
    Revoked,
}

impl SweepReport {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Unchanged => {}
            RowOutcome::Expired => self.subscriptions_expired += 1,
            RowOutcome::Renewed => self.subscriptions_renewed += 1,
            RowOutcome::RenewalSkipped => self.renewals_skipped += 1,
            RowOutcome::Revoked => self.grants_revoked += 1,
        }
    }
}

/// Expires, renews and revokes entitlements against the store.
pub struct Reconciler {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    worker: WorkerConfig,
    lifetimes: SessionLifetimes,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        clock: Arc<dyn Clock>,
        worker: WorkerConfig,
        lifetimes: SessionLifetimes,
    ) -> Self {
        Self {
            store,
            clock,
            worker,
            lifetimes,
        }
    }

    /// Run one full pass.
    ///
    /// Row failures are counted and logged; they never abort the pass.
    ///
    /// # Errors
    /// `StoreUnavailable` if the subscription or purchase listing cannot be read.
    pub async fn sweep(&self) -> Result<SweepReport, ModwardenError> {
        let mut report = SweepReport::default();
        let now = self.clock.now_utc();

        let subscriptions = self.store.active_subscriptions().await?;
        for sub in subscriptions.iter().filter(|s| s.expires_at <= now) {
            let outcome = self
                .with_retry("subscription", sub.id, || self.settle_subscription(sub.id))
                .await;
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(_) => report.row_errors += 1,
            }
        }

        let purchases = self.store.all_purchases().await?;
        let (expired, live): (Vec<Purchase>, Vec<Purchase>) = purchases
            .into_iter()
            .partition(|p| p.is_expired_at(now));

        for purchase in &expired {
            let outcome = self
                .with_retry("purchase", purchase.id, || {
                    self.revoke_purchase(purchase, &live)
                })
                .await;
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(_) => report.row_errors += 1,
            }
        }

        info!(
            expired = report.subscriptions_expired,
            renewed = report.subscriptions_renewed,
            skipped = report.renewals_skipped,
            revoked = report.grants_revoked,
            row_errors = report.row_errors,
            "Reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn with_retry<F, Fut>(
        &self,
        kind: &'static str,
        id: i64,
        mut attempt: F,
    ) -> Result<RowOutcome, ModwardenError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RowOutcome, ModwardenError>>,
    {
        let attempts = self.worker.max_row_attempts.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && tries < attempts => {
                    warn!(kind, id, attempt = tries, error = %e, "Row failed, retrying");
                    backoff(self.worker.retry_backoff).await;
                }
                Err(e) => {
                    let err = ModwardenError::ReconciliationRow {
                        kind,
                        id,
                        reason: e.to_string(),
                    };
                    error!(error = %err, "Giving up on row");
                    return Err(err);
                }
            }
        }
    }

    async fn settle_subscription(&self, id: i64) -> Result<RowOutcome, ModwardenError> {
        let now = self.clock.now_utc();
        let Some(sub) = self.store.subscription_by_id(id).await? else {
            return Ok(RowOutcome::Unchanged);
        };
        if !sub.active || sub.expires_at > now {
            return Ok(RowOutcome::Unchanged);
        }

        if !sub.auto_renew {
            self.deactivate(&sub, "not auto-renewing").await?;
            return Ok(RowOutcome::Expired);
        }

        let Some(bundle) = self.store.bundle_for_mods(&sub.covered_mods).await? else {
            warn!(
                subscription = sub.id,
                mods = %sub.covered_mods.to_csv(),
                "No bundle price for auto-renewal, leaving subscription as is"
            );
            return Ok(RowOutcome::RenewalSkipped);
        };

        let user = match self.store.user_by_identity(&sub.identity).await? {
            Some(user) if user.balance >= bundle.price => user,
            Some(_) => {
                self.deactivate(&sub, "insufficient balance").await?;
                return Ok(RowOutcome::Expired);
            }
            None => {
                self.deactivate(&sub, "subscriber not found").await?;
                return Ok(RowOutcome::Expired);
            }
        };

        let expires_at = renewal_end(sub.expires_at, self.worker.renewal_period, now);
        debug!(
            subscription = sub.id,
            identity = %sub.identity,
            price = bundle.price,
            balance = user.balance,
            expires_at = %expires_at,
            "Renewing subscription"
        );

        let mut unit = UnitOfWork::new();
        unit.push(StoreWrite::DebitBalance {
            user_id: user.id,
            amount: bundle.price,
        });
        unit.push(StoreWrite::RenewSubscription {
            id: sub.id,
            from: sub.expires_at,
            to: expires_at,
        });
        unit.push(StoreWrite::ExtendSession {
            identity: sub.identity.clone(),
            expiry: saturating_add(now, self.lifetimes.subscriber),
        });
        self.store.commit(unit).await?;
        info!(subscription = sub.id, price = bundle.price, "Subscription renewed");

        Ok(RowOutcome::Renewed)
    }

    async fn deactivate(&self, sub: &Subscription, reason: &str) -> Result<(), ModwardenError> {
        info!(subscription = sub.id, identity = %sub.identity, reason, "Subscription expired");
        let mut unit = UnitOfWork::new();
        unit.push(StoreWrite::ExpireSubscription {
            id: sub.id,
            expires_at: sub.expires_at,
        });
        self.store.commit(unit).await
    }

    async fn revoke_purchase(
        &self,
        purchase: &Purchase,
        live: &[Purchase],
    ) -> Result<RowOutcome, ModwardenError> {
        let mod_id = purchase.mod_id;
        let server_still_granted = live
            .iter()
            .any(|p| p.server_id == purchase.server_id && p.mod_id == mod_id);
        let user_still_granted = live
            .iter()
            .any(|p| p.buyer_user_id == purchase.buyer_user_id && p.mod_id == mod_id);

        let mut unit = UnitOfWork::new();

        if !server_still_granted {
            if let Some(server) = self.store.server_by_id(purchase.server_id).await? {
                if server.granted_mods.contains(mod_id) {
                    unit.push(StoreWrite::RevokeServerGrant {
                        server_id: server.id,
                        mod_id,
                    });
                }
            }
        }
        if !user_still_granted {
            if let Some(user) = self.store.user_by_id(purchase.buyer_user_id).await? {
                if user.claimed_mods.contains(mod_id) {
                    unit.push(StoreWrite::RevokeUserGrant {
                        user_id: user.id,
                        mod_id,
                    });
                }
            }
        }

        if unit.is_empty() {
            debug!(purchase = purchase.id, "Expired purchase already settled");
            return Ok(RowOutcome::Unchanged);
        }

        self.store.commit(unit).await?;
        info!(
            purchase = purchase.id,
            mod_id,
            server = purchase.server_id,
            user = purchase.buyer_user_id,
            "Expired grant revoked"
        );
        Ok(RowOutcome::Revoked)
    }
}

/// Next paid-period end: one period after the old end, or after `now` if
/// that would still be in the past.
fn renewal_end(expires_at: DateTime<Utc>, period: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let next = saturating_add(expires_at, period);
    if next > now {
        next
    } else {
        saturating_add(now, period)
    }
}

async fn backoff(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::model::{ActiveSession, ModBundle, ModSet, Server, User};
    use crate::store::MemoryStore;

    const NOW: &str = "2025-06-01T00:00:00Z";

    fn now() -> DateTime<Utc> {
        MockClock::from_rfc3339(NOW).now_utc()
    }

    fn reconciler(store: Arc<MemoryStore>) -> Reconciler {
        let worker = WorkerConfig {
            retry_backoff: Duration::ZERO,
            ..WorkerConfig::default()
        };
        Reconciler::new(
            store,
            Arc::new(MockClock::from_rfc3339(NOW)),
            worker,
            SessionLifetimes::default(),
        )
    }

    fn subscription(id: i64, identity: &str, auto_renew: bool, expires_in_days: i64) -> Subscription {
        Subscription {
            id,
            identity: identity.to_string(),
            steam_id: String::new(),
            covered_mods: ModSet::from([10, 11]),
            active: true,
            auto_renew,
            expires_at: now() + chrono::Duration::days(expires_in_days),
        }
    }

    fn purchase(id: i64, user: i64, server: i64, mod_id: i64, expires_in_days: i64) -> Purchase {
        Purchase {
            id,
            buyer_user_id: user,
            mod_id,
            server_id: server,
            purchased_at: now() - chrono::Duration::days(60),
            expires_at: now() + chrono::Duration::days(expires_in_days),
        }
    }

    async fn seed_owner(store: &MemoryStore, mods: ModSet) {
        let mut user = User::new(1, "owner");
        user.claimed_mods = mods.clone();
        store.insert_user(user).await;
        store
            .insert_server(Server {
                id: 7,
                owner_id: 1,
                name: "srv".to_string(),
                ip: "10.0.0.9".to_string(),
                granted_mods: mods,
            })
            .await;
    }

    #[test]
    fn test_renewal_end() {
        let period = Duration::from_secs(30 * 86_400);
        let end = now() - chrono::Duration::days(1);
        assert_eq!(renewal_end(end, period, now()), end + chrono::Duration::days(30));

        let long_ago = now() - chrono::Duration::days(90);
        assert_eq!(renewal_end(long_ago, period, now()), now() + chrono::Duration::days(30));

        assert_eq!(renewal_end(end, Duration::MAX, now()), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_non_renewing_subscription_expires_without_charge() {
        let store = Arc::new(MemoryStore::new());
        let mut user = User::new(1, "alice");
        user.balance = 1_000;
        store.insert_user(user).await;
        store.insert_subscription(subscription(1, "alice", false, -1)).await;

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report.subscriptions_expired, 1);
        let sub = store.subscription_by_id(1).await.unwrap().unwrap();
        assert!(!sub.active);
        let user = store.user_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(user.balance, 1_000);
    }

    #[tokio::test]
    async fn test_auto_renew_charges_once_and_extends() {
        let store = Arc::new(MemoryStore::new());
        let mut user = User::new(1, "alice");
        user.balance = 1_000;
        store.insert_user(user).await;
        store
            .insert_bundle(ModBundle {
                id: 1,
                developer: "dev".to_string(),
                covered_mods: ModSet::from([10, 11]),
                price: 300,
            })
            .await;
        store.insert_subscription(subscription(1, "alice", true, -1)).await;
        store
            .upsert_session(&ActiveSession {
                identity: "alice".to_string(),
                token: "t".to_string(),
                expiry: now() + chrono::Duration::minutes(5),
            })
            .await
            .unwrap();

        let reconciler = reconciler(Arc::clone(&store));
        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.subscriptions_renewed, 1);

        let user = store.user_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(user.balance, 700);
        let sub = store.subscription_by_id(1).await.unwrap().unwrap();
        assert!(sub.active);
        assert_eq!(sub.expires_at, now() + chrono::Duration::days(29));
        let session = store.session_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(session.expiry, now() + chrono::Duration::days(30));

        // A second sweep must not charge again.
        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        let user = store.user_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(user.balance, 700);
    }

    #[tokio::test]
    async fn test_missing_price_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut user = User::new(1, "alice");
        user.balance = 1_000;
        store.insert_user(user).await;
        let original = subscription(1, "alice", true, -1);
        store.insert_subscription(original.clone()).await;
        let writes_before = store.write_count();

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report.renewals_skipped, 1);
        assert_eq!(store.write_count(), writes_before);
        assert_eq!(store.subscription_by_id(1).await.unwrap().unwrap(), original);
        let user = store.user_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(user.balance, 1_000);
    }

    #[tokio::test]
    async fn test_insufficient_balance_deactivates() {
        let store = Arc::new(MemoryStore::new());
        let mut user = User::new(1, "alice");
        user.balance = 100;
        store.insert_user(user).await;
        store
            .insert_bundle(ModBundle {
                id: 1,
                developer: "dev".to_string(),
                covered_mods: ModSet::from([10, 11]),
                price: 300,
            })
            .await;
        store.insert_subscription(subscription(1, "alice", true, -1)).await;

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report.subscriptions_expired, 1);
        assert!(!store.subscription_by_id(1).await.unwrap().unwrap().active);
        let user = store.user_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(user.balance, 100);
    }

    #[tokio::test]
    async fn test_current_subscription_untouched() {
        let store = Arc::new(MemoryStore::new());
        store.insert_subscription(subscription(1, "alice", false, 5)).await;

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert!(store.subscription_by_id(1).await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_expired_purchase_revoked_from_server_and_user() {
        let store = Arc::new(MemoryStore::new());
        seed_owner(&store, ModSet::from([3, 4])).await;
        store.insert_purchase(purchase(1, 1, 7, 3, -2)).await;
        store.insert_purchase(purchase(2, 1, 7, 4, 20)).await;

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report.grants_revoked, 1);
        let server = store.server_by_id(7).await.unwrap().unwrap();
        assert_eq!(server.granted_mods, ModSet::from([4]));
        let user = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(user.claimed_mods, ModSet::from([4]));
    }

    #[tokio::test]
    async fn test_renewed_purchase_keeps_grant() {
        let store = Arc::new(MemoryStore::new());
        seed_owner(&store, ModSet::from([3])).await;
        store.insert_purchase(purchase(1, 1, 7, 3, -2)).await;
        store.insert_purchase(purchase(2, 1, 7, 3, 28)).await;

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report.grants_revoked, 0);
        assert!(store.server_by_id(7).await.unwrap().unwrap().granted_mods.contains(3));
        assert!(store.user_by_id(1).await.unwrap().unwrap().claimed_mods.contains(3));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        seed_owner(&store, ModSet::from([3])).await;
        store.insert_purchase(purchase(1, 1, 7, 3, -2)).await;
        store.fail_next_writes(2);

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report.grants_revoked, 1);
        assert_eq!(report.row_errors, 0);
        assert!(store.server_by_id(7).await.unwrap().unwrap().granted_mods.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_count_row_error_and_continue() {
        let store = Arc::new(MemoryStore::new());
        seed_owner(&store, ModSet::from([3, 4])).await;
        store.insert_purchase(purchase(1, 1, 7, 3, -2)).await;
        store.insert_purchase(purchase(2, 1, 7, 4, -2)).await;
        store.fail_next_writes(3);

        let report = reconciler(Arc::clone(&store)).sweep().await.unwrap();

        assert_eq!(report.row_errors, 1);
        assert_eq!(report.grants_revoked, 1);
        let server = store.server_by_id(7).await.unwrap().unwrap();
        assert_eq!(server.granted_mods, ModSet::from([3]));
        let user = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(user.claimed_mods, ModSet::from([3]));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_sweep() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let result = reconciler(Arc::clone(&store)).sweep().await;
        assert!(matches!(result, Err(ModwardenError::StoreUnavailable(_))));
    }
}
