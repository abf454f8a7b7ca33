//! Gateway - the single entry point the HTTP layer calls per request.
//!
//! The `Gateway` wires the pieces together:
//! - Path classification and the unroutable-path check
//! - Address limiting on exempt paths, identity limiting on guarded ones
//! - The batch queue that bounds concurrent session validations
//! - Session validation, including the admin role check

use crate::auth::SessionValidator;
use crate::clock::{Clock, SystemClock};
use crate::config::{GateConfig, ModwardenConfig};
use crate::gate::{
    classify, AdmittedRequest, BatchHandler, BatchQueue, Credentials, GateDecision,
    InboundRequest, PathClass,
};
use crate::limiter::{Admission, RateCounter};
use crate::model::Role;
use crate::store::EntitlementStore;
use crate::ModwardenError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// An admitted guarded request waiting for validation.
struct PendingRequest {
    request: InboundRequest,
    credentials: Credentials,
    required: Option<Role>,
    reply: oneshot::Sender<GateDecision>,
}

/// Batch stage: validates each drained request and answers its caller.
struct ValidationStage {
    validator: Arc<SessionValidator>,
}

#[async_trait]
impl BatchHandler<PendingRequest> for ValidationStage {
    async fn process(&self, item: PendingRequest) {
        let PendingRequest {
            request,
            credentials,
            required,
            reply,
        } = item;

        let decision = match self.validator.validate(&credentials, required).await {
            Ok(session) => GateDecision::Forward(AdmittedRequest {
                request,
                identity: Some(session.identity),
                role: Some(session.role),
            }),
            Err(e) => {
                if let ModwardenError::StoreUnavailable(detail) = &e {
                    error!(
                        identity = %credentials.identity,
                        detail = %detail,
                        "Session lookup failed"
                    );
                }
                GateDecision::deny(&e)
            }
        };

        // The caller may have gone away; nothing to do then.
        let _ = reply.send(decision);
    }
}

/// Request admission gateway.
///
/// Create one instance per process and share it across request handlers.
pub struct Gateway {
    config: GateConfig,
    clock: Arc<dyn Clock>,
    address_limiter: RateCounter,
    identity_limiter: RateCounter,
    validator: Arc<SessionValidator>,
    queue: BatchQueue<PendingRequest>,
}

impl Gateway {
    /// Create a gateway on the system clock.
    ///
    /// # Errors
    /// `ConfigError` if the configuration does not validate.
    pub fn new(
        config: &ModwardenConfig,
        store: Arc<dyn EntitlementStore>,
    ) -> Result<Self, ModwardenError> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a gateway with an explicit clock.
    ///
    /// # Errors
    /// `ConfigError` if the configuration does not validate.
    pub fn with_clock(
        config: &ModwardenConfig,
        store: Arc<dyn EntitlementStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ModwardenError> {
        config.validate()?;
        let gate = config.gate.clone();

        let validator = Arc::new(SessionValidator::new(store, Arc::clone(&clock)));
        let stage: Arc<dyn BatchHandler<PendingRequest>> = Arc::new(ValidationStage {
            validator: Arc::clone(&validator),
        });

        Ok(Self {
            address_limiter: RateCounter::new(gate.address_limit, gate.window_ttl),
            identity_limiter: RateCounter::new(gate.identity_limit, gate.window_ttl),
            queue: BatchQueue::new(stage, gate.batch_size, gate.queue_capacity),
            validator,
            clock,
            config: gate,
        })
    }

    /// Decide what happens to `request`.
    ///
    /// Pipeline:
    /// 1. Unroutable path -> 404
    /// 2. Exempt path -> address limit, then forward without a session
    /// 3. Missing credentials -> 401, no limiter state touched
    /// 4. Identity limit -> 429 once blocked
    /// 5. Queue for validation -> 503 if the queue is full
    /// 6. Session validation -> forward or uniform 401
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn handle(&self, request: InboundRequest) -> GateDecision {
        if !request.has_routable_path() {
            debug!(path = %request.path(), "Unroutable path");
            return GateDecision::deny(&ModwardenError::NotFound);
        }

        let class = classify(request.path(), &self.config);
        if class == PathClass::Exempt {
            return self.admit_exempt(request);
        }

        let credentials = match request.credentials() {
            Ok(credentials) => credentials,
            Err(e) => return GateDecision::deny(&e),
        };

        let admission = self
            .identity_limiter
            .check(&credentials.identity, self.clock.as_ref());
        if let Some(denied) = self.rate_denial(&admission, "identity", &credentials.identity) {
            return denied;
        }

        let (reply, answer) = oneshot::channel();
        let pending = PendingRequest {
            request,
            credentials,
            required: class.required_role(),
            reply,
        };
        if let Err(e) = self.queue.enqueue(pending) {
            warn!(depth = self.queue.len(), "Validation queue full");
            return GateDecision::deny(&e);
        }

        match answer.await {
            Ok(decision) => decision,
            Err(_) => {
                error!("Validation task dropped its reply");
                GateDecision::deny(&ModwardenError::StoreUnavailable(
                    "validation did not complete".to_string(),
                ))
            }
        }
    }

    /// The session validator behind the gate, for the public token check.
    pub fn validator(&self) -> &SessionValidator {
        &self.validator
    }

    /// Requests waiting for validation.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Forget rate windows idle past the TTL. Returns how many were dropped.
    pub fn purge_idle_windows(&self) -> usize {
        let clock = self.clock.as_ref();
        self.address_limiter.purge_idle(clock) + self.identity_limiter.purge_idle(clock)
    }

    fn admit_exempt(&self, request: InboundRequest) -> GateDecision {
        let admission = self
            .address_limiter
            .check(request.source_address(), self.clock.as_ref());
        if let Some(denied) = self.rate_denial(&admission, "address", request.source_address()) {
            return denied;
        }
        GateDecision::Forward(AdmittedRequest {
            request,
            identity: None,
            role: None,
        })
    }

    fn rate_denial(&self, admission: &Admission, scope: &str, key: &str) -> Option<GateDecision> {
        let Admission::Blocked { newly_blocked, .. } = admission else {
            return None;
        };
        let retry_after_secs = admission.retry_after_secs(self.clock.now_utc()).max(1);
        if *newly_blocked {
            warn!(scope, key, retry_after_secs, "Rate limit exceeded, blocking");
        }
        Some(GateDecision::deny(&ModwardenError::RateLimited {
            retry_after_secs,
        }))
    }
}
