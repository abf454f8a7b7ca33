//! Persistent record shapes as seen by this crate.

use crate::model::ModSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User row id.
pub type UserId = i64;
/// Server row id.
pub type ServerId = i64;
/// Mod catalog id.
pub type ModId = i64;

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular customer.
    #[default]
    User,
    /// Mod developer.
    ModCreator,
    /// Administrator.
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::User => "user",
            Role::ModCreator => "modcreator",
            Role::Admin => "admin",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "modcreator" => Ok(Role::ModCreator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A registered account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Row id.
    pub id: UserId,
    /// Unique login string (the identity).
    pub login: String,
    /// Linked Steam account.
    pub steam_id: String,
    /// Linked Discord account.
    pub discord_id: String,
    /// One-way password hash.
    pub password_hash: String,
    /// Banned users are never admitted.
    pub banned: bool,
    /// Ad-hoc grants, partly superseded by purchases.
    pub claimed_mods: ModSet,
    /// Most recently issued session token.
    pub session_secret: Option<String>,
    /// Address of the last successful login.
    pub last_ip: String,
    /// Account role.
    pub role: Role,
    /// Balance in minor currency units.
    pub balance: i64,
}

impl User {
    /// A non-banned user with no grants.
    pub fn new(id: UserId, login: impl Into<String>) -> Self {
        Self {
            id,
            login: login.into(),
            steam_id: String::new(),
            discord_id: String::new(),
            password_hash: String::new(),
            banned: false,
            claimed_mods: ModSet::new(),
            session_secret: None,
            last_ip: String::new(),
            role: Role::User,
            balance: 0,
        }
    }
}

/// At most one per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    /// Login the session belongs to.
    pub identity: String,
    /// Token presented on every guarded request.
    pub token: String,
    /// Instant after which the session is rejected.
    pub expiry: DateTime<Utc>,
}

impl ActiveSession {
    /// Whether the session is still usable at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }
}

/// A game server owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Row id.
    pub id: ServerId,
    /// Owning user.
    pub owner_id: UserId,
    /// Display name.
    pub name: String,
    /// Address of the server.
    pub ip: String,
    /// Mods this server may load.
    pub granted_mods: ModSet,
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mod {
    /// Catalog id.
    pub id: ModId,
    /// Developer login.
    pub owner: String,
    /// Display name.
    pub name: String,
    /// Price in minor currency units.
    pub price: i64,
}

/// A developer's priced bundle of mods, sold as a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModBundle {
    /// Row id.
    pub id: i64,
    /// Developer login.
    pub developer: String,
    /// Mods covered by the bundle.
    pub covered_mods: ModSet,
    /// Renewal price in minor currency units.
    pub price: i64,
}

/// One granted mod on one server. Source of truth for purchase grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    /// Row id.
    pub id: i64,
    /// Buyer.
    pub buyer_user_id: UserId,
    /// Granted mod.
    pub mod_id: ModId,
    /// Server the mod was granted to.
    pub server_id: ServerId,
    /// Purchase time.
    pub purchased_at: DateTime<Utc>,
    /// Grant ends at this instant.
    pub expires_at: DateTime<Utc>,
}

impl Purchase {
    /// Whether the grant has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Blanket access to a developer bundle while active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Row id.
    pub id: i64,
    /// Subscriber login.
    pub identity: String,
    /// Subscriber Steam account.
    pub steam_id: String,
    /// Mods covered while active.
    pub covered_mods: ModSet,
    /// Whether the subscription currently grants access.
    pub active: bool,
    /// Charge the subscriber and extend on expiry.
    pub auto_renew: bool,
    /// End of the paid period.
    pub expires_at: DateTime<Utc>,
}

impl Subscription {
    /// Active and not yet past its paid period.
    pub fn is_current_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at > now
    }
}
