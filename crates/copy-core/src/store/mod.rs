//! State store: position mappings, pending exits, markers, metrics.
//!
//! Keys are namespaced per concern; TTLs are normative. Transient
//! failures surface as [`Error::StoreUnavailable`] and callers must
//! not treat unavailability as "no mapping".

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;

use crate::types::{PendingExit, PositionMapping};
use crate::Result;

/// Mapping lifetime. Refreshed on every update.
pub const MAPPING_TTL_SECS: u64 = 7 * 24 * 3600;
/// Pending exits expire after two days of failed retries.
pub const PENDING_EXIT_TTL_SECS: u64 = 48 * 3600;
/// Closed / orphan-notified markers.
pub const MARKER_TTL_SECS: u64 = 24 * 3600;
pub const HOUR_METRICS_TTL_SECS: u64 = 7 * 24 * 3600;
pub const DAY_METRICS_TTL_SECS: u64 = 30 * 24 * 3600;
/// Dashboard-facing perf window cache.
pub const PERF_WINDOW_TTL_SECS: u64 = 300;
pub const REPORT_TTL_SECS: u64 = 7 * 24 * 3600;
pub const STATS_SNAPSHOT_TTL_SECS: u64 = 60;
/// Per-store operation deadline.
pub const STORE_OP_TIMEOUT_SECS: u64 = 5;

pub(crate) fn mapping_key(source_account: &str, source_position: &str) -> String {
    format!("map:{source_account}:{source_position}")
}

pub(crate) fn pending_key(source_account: &str, source_position: &str) -> String {
    format!("pending:{source_account}:{source_position}")
}

pub(crate) fn closed_key(account: &str, position: &str) -> String {
    format!("closed:{account}:{position}")
}

pub(crate) fn orphan_key(account: &str, position: &str) -> String {
    format!("orphan:{account}:{position}")
}

pub(crate) fn alert_key(alert_id: &str) -> String {
    format!("alert:{alert_id}")
}

pub(crate) fn hour_metrics_key(route_id: &str, bucket: &str) -> String {
    format!("metrics:{route_id}:hour:{bucket}")
}

pub(crate) fn day_metrics_key(route_id: &str, bucket: &str) -> String {
    format!("metrics:{route_id}:day:{bucket}")
}

pub(crate) fn perf_key(route_id: &str, window: &str) -> String {
    format!("perf:{route_id}:{window}")
}

pub(crate) const STATS_SNAPSHOT_KEY: &str = "routing:stats:current";

/// Persistence operations the rest of the system depends on. Redis in
/// production, [`MemoryStore`] in tests.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Overwrites any existing mapping and refreshes its TTL.
    async fn put_mapping(&self, mapping: &PositionMapping) -> Result<()>;

    async fn get_mapping(
        &self,
        source_account: &str,
        source_position: &str,
    ) -> Result<Option<PositionMapping>>;

    async fn delete_mapping(&self, source_account: &str, source_position: &str) -> Result<()>;

    /// Best-effort scan; may miss mappings created after the scan starts.
    async fn list_mappings(&self, source_account: &str) -> Result<Vec<PositionMapping>>;

    /// Idempotent 24 h marker recording a confirmed destination close.
    async fn mark_closed(&self, account: &str, position: &str) -> Result<()>;

    async fn was_recently_closed(&self, account: &str, position: &str) -> Result<bool>;

    async fn queue_pending_exit(&self, exit: &PendingExit) -> Result<()>;

    /// Returns the queue for a source account, incrementing each
    /// returned entry's retry counter.
    async fn list_pending_exits(&self, source_account: &str) -> Result<Vec<PendingExit>>;

    async fn remove_pending_exit(
        &self,
        source_account: &str,
        source_position: &str,
    ) -> Result<()>;

    /// 24 h marker preventing duplicate orphan alerts.
    async fn mark_orphan_notified(&self, account: &str, position: &str) -> Result<()>;

    async fn was_orphan_notified(&self, account: &str, position: &str) -> Result<bool>;

    async fn mark_alert_sent(&self, alert_id: &str, ttl_secs: u64) -> Result<()>;

    async fn was_alert_sent(&self, alert_id: &str) -> Result<bool>;

    async fn write_hour_metrics(
        &self,
        route_id: &str,
        bucket: &str,
        fields: &[(String, String)],
    ) -> Result<()>;

    async fn write_day_metrics(
        &self,
        route_id: &str,
        bucket: &str,
        fields: &[(String, String)],
    ) -> Result<()>;

    async fn write_perf_window(&self, route_id: &str, window: &str, payload: &str) -> Result<()>;

    async fn put_report(&self, key: &str, payload: &str) -> Result<()>;

    /// Control-bus stats snapshot, 60 s TTL.
    async fn put_stats_snapshot(&self, payload: &str) -> Result<()>;
}
