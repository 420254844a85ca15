//! Core domain types for the copy routing engine.

pub mod account;
pub mod mapping;
pub mod position;
pub mod route;
pub mod rules;
pub mod stats;

pub use account::*;
pub use mapping::*;
pub use position::*;
pub use route::*;
pub use rules::*;
pub use stats::*;
