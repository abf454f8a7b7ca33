//! Durable entitlement store seam.
//!
//! The persistence engine is external. This crate only needs point lookups
//! by key and small multi-row commits, expressed by [`EntitlementStore`].

pub mod memory;

pub use memory::MemoryStore;

use crate::model::{
    ActiveSession, ModBundle, ModId, ModSet, Purchase, Server, ServerId, Subscription, User, UserId,
};
use crate::ModwardenError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One row write inside a [`UnitOfWork`].
///
/// Writes name the fields they touch and are applied to the row as it is at
/// commit time, so two writers planning from older reads never undo each
/// other. A write whose precondition no longer holds fails the whole unit
/// with `WriteConflict`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    /// Set the user's session token and last address.
    RecordLogin {
        /// User row id.
        user_id: UserId,
        /// Token issued by this login.
        session_secret: String,
        /// Source address of the login.
        last_ip: String,
    },
    /// Subtract `amount` from the balance. Conflicts if the balance is now
    /// below `amount`.
    DebitBalance {
        /// User row id.
        user_id: UserId,
        /// Minor units to subtract.
        amount: i64,
    },
    /// Remove a mod from the user's claimed set.
    RevokeUserGrant {
        /// User row id.
        user_id: UserId,
        /// Mod to remove.
        mod_id: ModId,
    },
    /// Remove a mod from the server's granted set.
    RevokeServerGrant {
        /// Server row id.
        server_id: ServerId,
        /// Mod to remove.
        mod_id: ModId,
    },
    /// Move an active subscription's end from `from` to `to`.
    RenewSubscription {
        /// Subscription row id.
        id: i64,
        /// End the renewal was planned against.
        from: DateTime<Utc>,
        /// New end.
        to: DateTime<Utc>,
    },
    /// Mark a subscription inactive if it still ends at `expires_at`.
    ExpireSubscription {
        /// Subscription row id.
        id: i64,
        /// End the expiry was planned against.
        expires_at: DateTime<Utc>,
    },
    /// Insert or replace the session for its identity. Rewriting the same
    /// token never shortens its expiry.
    Session(ActiveSession),
    /// Raise an existing session's expiry to at least `expiry`.
    ExtendSession {
        /// Login whose session is extended.
        identity: String,
        /// Lower bound for the new expiry.
        expiry: DateTime<Utc>,
    },
}

/// Writes that must land together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWork {
    writes: Vec<StoreWrite>,
}

impl UnitOfWork {
    /// Empty unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write.
    pub fn push(&mut self, write: StoreWrite) {
        self.writes.push(write);
    }

    /// Whether there is nothing to commit.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Consume into the ordered write list.
    pub fn into_writes(self) -> Vec<StoreWrite> {
        self.writes
    }
}

/// Durable store collaborator.
///
/// Lookup methods return `Ok(None)` for a missing row; `Err` is reserved for
/// the store itself failing and is always a `StoreUnavailable`.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// User by login.
    async fn user_by_identity(&self, identity: &str) -> Result<Option<User>, ModwardenError>;

    /// User by row id.
    async fn user_by_id(&self, id: UserId) -> Result<Option<User>, ModwardenError>;

    /// Replace an existing user row.
    async fn update_user(&self, user: &User) -> Result<(), ModwardenError>;

    /// Session for a login.
    async fn session_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<ActiveSession>, ModwardenError>;

    /// Session holding a given token.
    async fn session_by_token(&self, token: &str) -> Result<Option<ActiveSession>, ModwardenError>;

    /// Insert or update in place; never creates a second row per identity.
    async fn upsert_session(&self, session: &ActiveSession) -> Result<(), ModwardenError>;

    /// All subscriptions with `active = true`.
    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, ModwardenError>;

    /// Subscription by row id.
    async fn subscription_by_id(&self, id: i64) -> Result<Option<Subscription>, ModwardenError>;

    /// Replace an existing subscription row.
    async fn update_subscription(&self, subscription: &Subscription)
        -> Result<(), ModwardenError>;

    /// Bundle whose covered mods equal `mods` exactly.
    async fn bundle_for_mods(&self, mods: &ModSet) -> Result<Option<ModBundle>, ModwardenError>;

    /// Every purchase row.
    async fn all_purchases(&self) -> Result<Vec<Purchase>, ModwardenError>;

    /// Server by row id.
    async fn server_by_id(&self, id: ServerId) -> Result<Option<Server>, ModwardenError>;

    /// Replace an existing server row.
    async fn update_server(&self, server: &Server) -> Result<(), ModwardenError>;

    /// Apply all writes atomically as one short transaction.
    ///
    /// Fails with `WriteConflict`, leaving every row untouched, if any write
    /// targets a missing row or its precondition no longer holds.
    async fn commit(&self, unit: UnitOfWork) -> Result<(), ModwardenError>;
}
