//! Entitlement records shared by the gate, the session layer and the reconciler.

pub mod modset;
pub mod records;

pub use modset::ModSet;
pub use records::{
    ActiveSession, Mod, ModBundle, ModId, Purchase, Role, Server, ServerId, Subscription, User,
    UserId,
};
