//! In-process entitlement store.
//!
//! Backs the demo and the tests. All tables live behind one async `RwLock`.
//! A [`UnitOfWork`] is applied to a staged copy of the tables and swapped in
//! only when every write succeeded. Failure injection lets tests exercise
//! transient store errors.

use crate::model::{
    ActiveSession, ModBundle, ModSet, Purchase, Server, ServerId, Subscription, User, UserId,
};
use crate::store::{EntitlementStore, StoreWrite, UnitOfWork};
use crate::ModwardenError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    sessions: HashMap<String, ActiveSession>,
    servers: BTreeMap<ServerId, Server>,
    subscriptions: BTreeMap<i64, Subscription>,
    bundles: Vec<ModBundle>,
    purchases: Vec<Purchase>,
}

fn conflict(kind: &str, id: i64, what: &str) -> ModwardenError {
    ModwardenError::WriteConflict(format!("{} {} {}", kind, id, what))
}

impl Tables {
    fn user_mut(&mut self, id: UserId) -> Result<&mut User, ModwardenError> {
        self.users
            .get_mut(&id)
            .ok_or_else(|| conflict("user", id, "not found"))
    }

    fn server_mut(&mut self, id: ServerId) -> Result<&mut Server, ModwardenError> {
        self.servers
            .get_mut(&id)
            .ok_or_else(|| conflict("server", id, "not found"))
    }

    fn subscription_mut(&mut self, id: i64) -> Result<&mut Subscription, ModwardenError> {
        self.subscriptions
            .get_mut(&id)
            .ok_or_else(|| conflict("subscription", id, "not found"))
    }

    fn apply(&mut self, write: StoreWrite) -> Result<(), ModwardenError> {
        match write {
            StoreWrite::RecordLogin {
                user_id,
                session_secret,
                last_ip,
            } => {
                let user = self.user_mut(user_id)?;
                user.session_secret = Some(session_secret);
                user.last_ip = last_ip;
            }
            StoreWrite::DebitBalance { user_id, amount } => {
                let user = self.user_mut(user_id)?;
                if user.balance < amount {
                    return Err(conflict("user", user_id, "balance no longer covers the debit"));
                }
                user.balance -= amount;
            }
            StoreWrite::RevokeUserGrant { user_id, mod_id } => {
                self.user_mut(user_id)?.claimed_mods.remove(mod_id);
            }
            StoreWrite::RevokeServerGrant { server_id, mod_id } => {
                self.server_mut(server_id)?.granted_mods.remove(mod_id);
            }
            StoreWrite::RenewSubscription { id, from, to } => {
                let sub = self.subscription_mut(id)?;
                if !sub.active || sub.expires_at != from {
                    return Err(conflict("subscription", id, "changed since it was read"));
                }
                sub.expires_at = to;
            }
            StoreWrite::ExpireSubscription { id, expires_at } => {
                let sub = self.subscription_mut(id)?;
                if sub.expires_at != expires_at {
                    return Err(conflict("subscription", id, "changed since it was read"));
                }
                sub.active = false;
            }
            StoreWrite::Session(mut session) => {
                if let Some(current) = self.sessions.get(&session.identity) {
                    if current.token == session.token {
                        session.expiry = session.expiry.max(current.expiry);
                    }
                }
                self.sessions.insert(session.identity.clone(), session);
            }
            StoreWrite::ExtendSession { identity, expiry } => {
                if let Some(session) = self.sessions.get_mut(&identity) {
                    session.expiry = session.expiry.max(expiry);
                }
            }
        }
        Ok(())
    }
}

/// In-memory [`EntitlementStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
    failing_writes: AtomicUsize,
    session_lookups: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user row.
    pub async fn insert_user(&self, user: User) {
        self.tables.write().await.users.insert(user.id, user);
    }

    /// Seed a server row.
    pub async fn insert_server(&self, server: Server) {
        self.tables.write().await.servers.insert(server.id, server);
    }

    /// Seed a subscription row.
    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.tables
            .write()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Seed a bundle row.
    pub async fn insert_bundle(&self, bundle: ModBundle) {
        self.tables.write().await.bundles.push(bundle);
    }

    /// Seed a purchase row.
    pub async fn insert_purchase(&self, purchase: Purchase) {
        self.tables.write().await.purchases.push(purchase);
    }

    /// Make every call fail with `StoreUnavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` write calls (updates, upserts and commits).
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of session lookups served so far.
    pub fn session_lookups(&self) -> usize {
        self.session_lookups.load(Ordering::SeqCst)
    }

    /// Number of successful write calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ModwardenError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ModwardenError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), ModwardenError> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ModwardenError::StoreUnavailable(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }

    async fn write_one<F>(&self, write: F) -> Result<(), ModwardenError>
    where
        F: FnOnce(&mut Tables) -> Result<(), ModwardenError>,
    {
        self.check_writable()?;
        write(&mut *self.tables.write().await)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn user_by_identity(&self, identity: &str) -> Result<Option<User>, ModwardenError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.login == identity).cloned())
    }

    async fn user_by_id(&self, id: UserId) -> Result<Option<User>, ModwardenError> {
        self.check_available()?;
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn update_user(&self, user: &User) -> Result<(), ModwardenError> {
        self.write_one(|tables| {
            *tables.user_mut(user.id)? = user.clone();
            Ok(())
        })
        .await
    }

    async fn session_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<ActiveSession>, ModwardenError> {
        self.check_available()?;
        self.session_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.read().await.sessions.get(identity).cloned())
    }

    async fn session_by_token(&self, token: &str) -> Result<Option<ActiveSession>, ModwardenError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.sessions.values().find(|s| s.token == token).cloned())
    }

    async fn upsert_session(&self, session: &ActiveSession) -> Result<(), ModwardenError> {
        self.write_one(|tables| tables.apply(StoreWrite::Session(session.clone())))
            .await
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, ModwardenError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn subscription_by_id(&self, id: i64) -> Result<Option<Subscription>, ModwardenError> {
        self.check_available()?;
        Ok(self.tables.read().await.subscriptions.get(&id).cloned())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<(), ModwardenError> {
        self.write_one(|tables| {
            *tables.subscription_mut(subscription.id)? = subscription.clone();
            Ok(())
        })
        .await
    }

    async fn bundle_for_mods(&self, mods: &ModSet) -> Result<Option<ModBundle>, ModwardenError> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .bundles
            .iter()
            .find(|b| &b.covered_mods == mods)
            .cloned())
    }

    async fn all_purchases(&self) -> Result<Vec<Purchase>, ModwardenError> {
        self.check_available()?;
        Ok(self.tables.read().await.purchases.clone())
    }

    async fn server_by_id(&self, id: ServerId) -> Result<Option<Server>, ModwardenError> {
        self.check_available()?;
        Ok(self.tables.read().await.servers.get(&id).cloned())
    }

    async fn update_server(&self, server: &Server) -> Result<(), ModwardenError> {
        self.write_one(|tables| {
            *tables.server_mut(server.id)? = server.clone();
            Ok(())
        })
        .await
    }

    async fn commit(&self, unit: UnitOfWork) -> Result<(), ModwardenError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        for write in unit.into_writes() {
            staged.apply(write)?;
        }
        *tables = staged;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
