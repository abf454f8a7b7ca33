//! Credential login: password check, then session issuance.

use crate::auth::password::PasswordHasher;
use crate::auth::token::{fingerprint, TokenIssuer};
use crate::model::User;
use crate::store::{EntitlementStore, StoreWrite, UnitOfWork};
use crate::ModwardenError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// What a successful login hands back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Session token to present as `Bearer`.
    pub token: String,
    /// Login the token belongs to.
    pub identity: String,
    /// Linked Steam account.
    pub steam_id: String,
    /// Address recorded for this login.
    pub last_ip: String,
    /// When the session stops being accepted.
    pub expires_at: DateTime<Utc>,
}

/// Checks passwords and issues sessions.
pub struct LoginService {
    store: Arc<dyn EntitlementStore>,
    issuer: Arc<TokenIssuer>,
    hasher: Arc<dyn PasswordHasher>,
}

impl LoginService {
    /// Create a login service.
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        issuer: Arc<TokenIssuer>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            store,
            issuer,
            hasher,
        }
    }

    /// Log `identity` in from `source_address`.
    ///
    /// The session row and the user's token and address fields are written
    /// in one commit. Only those fields are touched, so a reconciliation
    /// landing between the password check and the commit is preserved.
    ///
    /// # Errors
    /// - `AuthDenied` for an unknown identity, a banned user or a wrong password
    /// - `StoreUnavailable` / `TokenIssue` if issuance fails
    /// - `WriteConflict` if the user row vanished before the commit
    pub async fn login(
        &self,
        identity: &str,
        password: &str,
        source_address: &str,
    ) -> Result<LoginOutcome, ModwardenError> {
        let user = self.authenticate(identity, password).await?;

        let issued = self.issuer.plan(identity, source_address).await?;
        let session = issued.session;

        let mut unit = UnitOfWork::new();
        unit.push(StoreWrite::Session(session.clone()));
        unit.push(StoreWrite::RecordLogin {
            user_id: user.id,
            session_secret: session.token.clone(),
            last_ip: source_address.to_string(),
        });
        self.store.commit(unit).await?;

        info!(
            identity,
            token = %fingerprint(&session.token),
            refreshed = issued.refreshed,
            source = source_address,
            "Login succeeded"
        );

        Ok(LoginOutcome {
            token: session.token,
            identity: user.login,
            steam_id: user.steam_id,
            last_ip: source_address.to_string(),
            expires_at: session.expiry,
        })
    }

    async fn authenticate(&self, identity: &str, password: &str) -> Result<User, ModwardenError> {
        let user = self.store.user_by_identity(identity).await?;
        match user {
            Some(user) if user.banned => {
                warn!(identity, "Login refused: banned");
                Err(ModwardenError::AuthDenied)
            }
            Some(user) if self.hasher.verify(password, &user.password_hash) => Ok(user),
            Some(_) => {
                warn!(identity, "Login refused: bad password");
                Err(ModwardenError::AuthDenied)
            }
            None => {
                warn!(identity, "Login refused: unknown identity");
                Err(ModwardenError::AuthDenied)
            }
        }
    }
}
