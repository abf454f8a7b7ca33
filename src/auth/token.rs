//! Session token issuance.
//!
//! Tokens are HS256 JWTs signed with a key derived from a per-user seed
//! (`<prefix>-<identity>-`). Short seeds are padded with random alphanumeric
//! filler up to the minimum key length. The token is a session nonce that is
//! checked by exact match against the stored session, never by re-deriving
//! the key, so the filler does not need to be reproducible.

use crate::clock::{saturating_add, Clock};
use crate::config::{SessionLifetimes, TokenConfig};
use crate::model::ActiveSession;
use crate::store::EntitlementStore;
use crate::ModwardenError;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Identity the token was issued to.
    pub sub: String,
    /// Address the login came from.
    pub ip: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Unique token id.
    pub jti: String,
}

/// A session ready to be stored, plus how it came about.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedSession {
    /// Session row to upsert.
    pub session: ActiveSession,
    /// `true` if an existing valid session was extended instead of replaced.
    pub refreshed: bool,
}

/// Short, non-reversible token tag for logs.
pub fn fingerprint(token: &str) -> String {
    hex::encode(&Sha256::digest(token.as_bytes())[..6])
}

/// Derives signing keys, mints tokens and upserts the per-identity session.
pub struct TokenIssuer {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
    lifetimes: SessionLifetimes,
    tokens: TokenConfig,
}

impl TokenIssuer {
    /// Create an issuer.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        clock: Arc<dyn Clock>,
        lifetimes: SessionLifetimes,
        tokens: TokenConfig,
    ) -> Self {
        Self {
            store,
            clock,
            lifetimes,
            tokens,
        }
    }

    /// Signing key for `identity`: the seed cut or padded to the minimum length.
    pub fn derive_signing_key(&self, identity: &str) -> Vec<u8> {
        let seed = format!("{}-{}-", self.tokens.seed_prefix, identity);
        let mut key = seed.into_bytes();
        let min = self.tokens.min_key_length;

        if key.len() >= min {
            key.truncate(min);
        } else {
            let filler = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(min - key.len());
            key.extend(filler);
        }
        key
    }

    /// Mint a signed token for `identity` valid for `lifetime`.
    pub fn mint(
        &self,
        identity: &str,
        source_address: &str,
        lifetime: Duration,
    ) -> Result<(String, DateTime<Utc>), ModwardenError> {
        let now = self.clock.now_utc();
        let expiry = saturating_add(now, lifetime);

        let claims = SessionClaims {
            sub: identity.to_string(),
            ip: source_address.to_string(),
            iat: now.timestamp(),
            exp: expiry.timestamp(),
            jti: format!("{:032x}", rand::random::<u128>()),
        };

        let key = EncodingKey::from_secret(&self.derive_signing_key(identity));
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| ModwardenError::TokenIssue(e.to_string()))?;

        Ok((token, expiry))
    }

    /// Decide the session for a successful login without writing it.
    ///
    /// A still-valid session keeps its token and has its expiry pushed out;
    /// otherwise a new token is minted. Known-good subscribers get the
    /// subscriber lifetime either way. Expiry never moves backwards.
    pub async fn plan(
        &self,
        identity: &str,
        source_address: &str,
    ) -> Result<IssuedSession, ModwardenError> {
        let now = self.clock.now_utc();
        let existing = self.store.session_by_identity(identity).await?;
        let subscriber = self
            .store
            .active_subscriptions()
            .await?
            .iter()
            .any(|s| s.identity == identity && s.is_current_at(now));

        match existing {
            Some(current) if current.is_valid_at(now) => {
                let lifetime = if subscriber {
                    self.lifetimes.subscriber
                } else {
                    self.lifetimes.returning_session
                };
                let expiry = current.expiry.max(saturating_add(now, lifetime));
                Ok(IssuedSession {
                    session: ActiveSession {
                        expiry,
                        ..current
                    },
                    refreshed: true,
                })
            }
            _ => {
                let lifetime = if subscriber {
                    self.lifetimes.subscriber
                } else {
                    self.lifetimes.new_session
                };
                let (token, expiry) = self.mint(identity, source_address, lifetime)?;
                Ok(IssuedSession {
                    session: ActiveSession {
                        identity: identity.to_string(),
                        token,
                        expiry,
                    },
                    refreshed: false,
                })
            }
        }
    }

    /// Plan and upsert the session for `identity`.
    pub async fn issue(
        &self,
        identity: &str,
        source_address: &str,
    ) -> Result<IssuedSession, ModwardenError> {
        let issued = self.plan(identity, source_address).await?;
        self.store.upsert_session(&issued.session).await?;
        info!(
            identity,
            token = %fingerprint(&issued.session.token),
            refreshed = issued.refreshed,
            expiry = %issued.session.expiry,
            "Session issued"
        );
        Ok(issued)
    }
}
