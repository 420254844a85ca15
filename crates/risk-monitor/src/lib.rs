//! Risk Monitor
//!
//! Global loss supervision, per-route performance metrics, and alert
//! evaluation over worker snapshots.

pub mod alerts;
pub mod perf;
pub mod supervisor;

pub use alerts::{Alert, AlertSettings};
pub use perf::{PerfMonitor, PerfMonitorConfig};
pub use supervisor::{EmergencyStopConfig, GlobalLossSupervisor};
