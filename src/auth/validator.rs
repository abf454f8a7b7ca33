//! Session validation for guarded requests.
//!
//! Every failure is reported to the caller as the same `AuthDenied`; the
//! specific reason only goes to the log, keyed by a token fingerprint.

use crate::auth::password::constant_time_eq;
use crate::auth::token::fingerprint;
use crate::clock::Clock;
use crate::gate::Credentials;
use crate::model::Role;
use crate::store::EntitlementStore;
use crate::ModwardenError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// A session that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSession {
    /// Validated login.
    pub identity: String,
    /// Role held by the login.
    pub role: Role,
    /// When the session stops being accepted.
    pub expiry: DateTime<Utc>,
}

/// Expiry report for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    /// Stored expiry of the session holding the token.
    pub expires_at: DateTime<Utc>,
    /// Whether the session is still usable.
    pub valid: bool,
}

/// Check that a role meets the path requirement.
///
/// Admin satisfies every requirement; other roles only satisfy their own.
///
/// # Errors
/// `AuthDenied` when the role falls short.
pub fn check_role(role: Role, required: Option<Role>) -> Result<(), ModwardenError> {
    match required {
        None => Ok(()),
        Some(_) if role == Role::Admin => Ok(()),
        Some(needed) if needed == role => Ok(()),
        Some(_) => Err(ModwardenError::AuthDenied),
    }
}

/// Validates presented credentials against the stored session.
pub struct SessionValidator {
    store: Arc<dyn EntitlementStore>,
    clock: Arc<dyn Clock>,
}

impl SessionValidator {
    /// Create a validator.
    pub fn new(store: Arc<dyn EntitlementStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate `credentials`, optionally requiring a role.
    ///
    /// Order: user exists, not banned, role satisfied, session exists and is
    /// unexpired, presented token equals the stored one.
    ///
    /// # Errors
    /// - `AuthDenied` for every rejection
    /// - `StoreUnavailable` if the store cannot be read
    pub async fn validate(
        &self,
        credentials: &Credentials,
        required: Option<Role>,
    ) -> Result<ValidatedSession, ModwardenError> {
        let identity = credentials.identity.as_str();
        let token_tag = fingerprint(&credentials.token);

        let Some(user) = self.store.user_by_identity(identity).await? else {
            return Err(deny(identity, &token_tag, "unknown identity"));
        };

        if user.banned {
            return Err(deny(identity, &token_tag, "identity banned"));
        }

        if check_role(user.role, required).is_err() {
            return Err(deny(identity, &token_tag, "role insufficient"));
        }

        let Some(session) = self.store.session_by_identity(identity).await? else {
            return Err(deny(identity, &token_tag, "no active session"));
        };

        let now = self.clock.now_utc();
        if !session.is_valid_at(now) {
            return Err(deny(identity, &token_tag, "session expired"));
        }

        if !constant_time_eq(&session.token, &credentials.token) {
            return Err(deny(identity, &token_tag, "token mismatch"));
        }

        debug!(identity, token = %token_tag, "Session validated");
        Ok(ValidatedSession {
            identity: user.login,
            role: user.role,
            expiry: session.expiry,
        })
    }

    /// Expiry and validity of the session holding `token`, if any.
    pub async fn token_status(&self, token: &str) -> Result<Option<TokenStatus>, ModwardenError> {
        let now = self.clock.now_utc();
        Ok(self
            .store
            .session_by_token(token)
            .await?
            .map(|session| TokenStatus {
                expires_at: session.expiry,
                valid: session.is_valid_at(now),
            }))
    }
}

fn deny(identity: &str, token_tag: &str, reason: &'static str) -> ModwardenError {
    warn!(identity, token = %token_tag, reason, "Session rejected");
    ModwardenError::AuthDenied
}
