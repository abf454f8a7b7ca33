//! # Modwarden
//!
//! **Request admission, session validation and entitlement reconciliation
//! for a mod-distribution backend.**
//!
//! Modwarden sits between the HTTP layer and business logic. Every inbound
//! request goes through one decision function that either forwards it or
//! answers directly, and a background worker keeps denormalized mod grants
//! consistent as purchases and subscriptions expire.
//!
//! ## Features
//!
//! - **Sliding-window rate limiting** per identity, and per address on
//!   exempt paths, with temporary blocks
//! - **Race-free accounting**: check-and-increment is atomic per key
//! - **Bounded batch queue**: session validations drain in fixed-size
//!   concurrent batches, one drain loop at a time
//! - **Uniform denials**: banned, expired, mismatched and role failures all
//!   look the same to the client
//! - **Scheduled reconciliation**: subscriptions expire or auto-renew,
//!   expired purchase grants are stripped from servers and users together
//!
//! ## Quickstart
//!
//! ```no_run
//! use modwarden::{Gateway, GateDecision, InboundRequest, MemoryStore, ModwardenConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), modwarden::ModwardenError> {
//! let store = Arc::new(MemoryStore::new());
//! let gateway = Gateway::new(&ModwardenConfig::default(), store)?;
//!
//! let request = InboundRequest::new("/api/servers/mine", "203.0.113.7")
//!     .with_credentials("session-token", "alice");
//!
//! match gateway.handle(request).await {
//!     GateDecision::Forward(admitted) => println!("forward for {:?}", admitted.identity),
//!     GateDecision::Respond(resp) => println!("{} {}", resp.status, resp.body),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Store
//!
//! Persistence is external. Implement [`EntitlementStore`] over your
//! database; [`MemoryStore`] is provided for tests and demos.
//!
//! See [`ModwardenConfig`] for every tunable and its default.

#![warn(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Records and persistence seam
pub mod model;
pub mod store;

// Admission layer
pub mod gate;
pub mod limiter;

// Session layer
pub mod auth;

// Background reconciliation
pub mod reconcile;

// Gateway (main public API)
pub mod gateway;

// Re-exports for public API
pub use auth::{
    LoginOutcome, LoginService, PasswordHasher, SessionValidator, Sha256Hasher, TokenIssuer,
};
pub use clock::{Clock, SystemClock};
pub use config::{GateConfig, ModwardenConfig, SessionLifetimes, TokenConfig, WorkerConfig};
pub use errors::ModwardenError;
pub use gate::{AdmittedRequest, GateDecision, GateResponse, InboundRequest};
pub use gateway::Gateway;
pub use limiter::{RateCounter, RatePolicy};
pub use model::{ActiveSession, ModBundle, ModSet, Purchase, Role, Server, Subscription, User};
pub use reconcile::{ReconciliationWorker, Reconciler, SweepReport};
pub use store::{EntitlementStore, MemoryStore, UnitOfWork};

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
