//! Admission gate building blocks: request shape, path classes, the
//! decision type handed back to the HTTP layer, and the batch queue.

pub mod queue;
pub mod request;

pub use queue::{BatchHandler, BatchQueue};
pub use request::{
    classify, AdmittedRequest, Credentials, GateDecision, GateResponse, InboundRequest, PathClass,
};
