//! Relay pipeline.
//!
//! Every inbound event flows through:
//! 1. `MediaGroupGate::claim_first()`: one handler per media-group burst
//! 2. `RuleEngine::evaluate()`: which forwarders take the event
//! 3. `ContentTransformer::transform()`: per-forwarder text rewriting
//! 4. `DispatchOrchestrator`: sends, edits, pins and deletes, keeping the
//!    correlation store in step

pub mod dispatch;
pub mod gate;
pub mod transform;

pub use dispatch::{
    DispatchConfig, DispatchOrchestrator, DispatchOutcome, DispatchState, SkipReason,
};
pub use gate::MediaGroupGate;
pub use transform::{ContentTransformer, TextLimit};
