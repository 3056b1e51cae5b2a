//! Forwarding rules: the persisted registry and the matching engine.

pub mod engine;
pub mod model;
pub mod registration;
pub mod store;

pub use engine::{MatchOutcome, RuleEngine};
pub use model::{Forwarder, ForwardingMode, ReplaceMode, RuleFile};
pub use store::RuleStore;
