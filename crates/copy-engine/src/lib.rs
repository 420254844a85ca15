//! Copy Engine
//!
//! One worker per enabled route mirrors a source account's position
//! lifecycle onto a destination account, gated by the filter pipeline
//! and sized by the rule set.

pub mod filters;
pub mod sizing;
pub mod state;
pub mod worker;

pub use filters::{FilterDecision, FilterPipeline};
pub use worker::{CopyWorker, WorkerConfig, WorkerHandle};
