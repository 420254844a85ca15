//! Copy Router
//!
//! Loads the declarative routing configuration, owns the lifecycle of
//! one copy worker per enabled route, and exposes the control bus.

pub mod config;
pub mod control;
pub mod router;

pub use config::RoutingConfig;
pub use router::{AdvancedRouter, RouterDeps};
