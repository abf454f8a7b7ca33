//! Modwarden error types.

use thiserror::Error;

/// Errors produced by the admission gateway, session layer and reconciler.
#[derive(Debug, Error)]
pub enum ModwardenError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Request path could not be parsed.
    #[error("The requested resource was not found")]
    NotFound,

    /// Identity or token header missing or malformed. Never retried.
    #[error("Missing or malformed credentials")]
    MissingCredentials,

    /// Rate threshold exceeded; clears once the block elapses.
    #[error("Too many requests, blocked for {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the block lifts.
        retry_after_secs: u64,
    },

    /// Credentials were well-formed but failed validation.
    ///
    /// Banned, expired, mismatched and role failures all collapse into this
    /// variant so callers cannot tell which check failed.
    #[error("Unauthorized")]
    AuthDenied,

    /// Downstream store lookup or write failed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A commit no longer matches the rows it was planned against.
    ///
    /// The row changed (or vanished) between the read and the commit; a
    /// retry re-reads and plans again.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// A stored value could not be decoded. Retrying will not help.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Batch queue is at its high-water mark.
    #[error("Request queue is full")]
    QueueFull,

    /// Token could not be minted.
    #[error("Token issue error: {0}")]
    TokenIssue(String),

    /// A single reconciliation row could not be applied.
    #[error("Reconciliation of {kind} {id} failed: {reason}")]
    ReconciliationRow {
        /// Row kind ("subscription" or "purchase").
        kind: &'static str,
        /// Row id.
        id: i64,
        /// Underlying failure.
        reason: String,
    },
}

impl ModwardenError {
    /// HTTP-class status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::MissingCredentials | Self::AuthDenied => 401,
            Self::RateLimited { .. } => 429,
            Self::QueueFull => 503,
            Self::ConfigError(_)
            | Self::StoreUnavailable(_)
            | Self::WriteConflict(_)
            | Self::CorruptRecord(_)
            | Self::TokenIssue(_)
            | Self::ReconciliationRow { .. } => 500,
        }
    }

    /// Message safe to return to a client.
    ///
    /// Internal details (store errors, row ids) are never included.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound => "The requested resource was not found.".to_string(),
            Self::MissingCredentials => "Missing identity or token.".to_string(),
            Self::AuthDenied => "Unauthorized.".to_string(),
            Self::RateLimited { retry_after_secs } => format!(
                "Too many requests. You are temporarily blocked for {}s.",
                retry_after_secs
            ),
            Self::QueueFull => "Server is busy, retry shortly.".to_string(),
            _ => "It seems there was an error. Don't worry, we'll fix it soon.".to_string(),
        }
    }

    /// Whether a caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::StoreUnavailable(_)
                | Self::WriteConflict(_)
                | Self::QueueFull
        )
    }
}
