//! In-process state store used by tests and as a harness fake.
//!
//! Mirrors the Redis key/TTL semantics closely enough that worker
//! logic cannot tell the difference, and can simulate an outage so
//! `StoreUnavailable` paths are exercisable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::*;
use crate::types::{PendingExit, PositionMapping};
use crate::{Error, Result};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a store outage; every operation fails until restored.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    async fn set(&self, key: String, value: String, ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live())
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// Test hook: raw read without availability or TTL filtering.
    pub async fn raw_get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).map(|e| e.value.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn put_mapping(&self, mapping: &PositionMapping) -> Result<()> {
        let key = mapping_key(&mapping.source_account_id, &mapping.source_position_id);
        self.set(key, serde_json::to_string(mapping)?, MAPPING_TTL_SECS)
            .await
    }

    async fn get_mapping(
        &self,
        source_account: &str,
        source_position: &str,
    ) -> Result<Option<PositionMapping>> {
        match self.get(&mapping_key(source_account, source_position)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_mapping(&self, source_account: &str, source_position: &str) -> Result<()> {
        self.del(&mapping_key(source_account, source_position)).await
    }

    async fn list_mappings(&self, source_account: &str) -> Result<Vec<PositionMapping>> {
        let prefix = format!("map:{source_account}:");
        let keys = self.keys_with_prefix(&prefix).await?;
        let mut mappings = Vec::new();
        for key in keys {
            if let Some(json) = self.get(&key).await? {
                mappings.push(serde_json::from_str(&json)?);
            }
        }
        Ok(mappings)
    }

    async fn mark_closed(&self, account: &str, position: &str) -> Result<()> {
        self.set(closed_key(account, position), "1".to_string(), MARKER_TTL_SECS)
            .await
    }

    async fn was_recently_closed(&self, account: &str, position: &str) -> Result<bool> {
        Ok(self.get(&closed_key(account, position)).await?.is_some())
    }

    async fn queue_pending_exit(&self, exit: &PendingExit) -> Result<()> {
        let key = pending_key(
            &exit.mapping.source_account_id,
            &exit.mapping.source_position_id,
        );
        self.set(key, serde_json::to_string(exit)?, PENDING_EXIT_TTL_SECS)
            .await
    }

    async fn list_pending_exits(&self, source_account: &str) -> Result<Vec<PendingExit>> {
        let prefix = format!("pending:{source_account}:");
        let keys = self.keys_with_prefix(&prefix).await?;
        let mut exits = Vec::new();
        let mut entries = self.entries.write().await;
        for key in keys {
            let Some(entry) = entries.get_mut(&key) else {
                continue;
            };
            let mut exit: PendingExit = serde_json::from_str(&entry.value)?;
            exit.retry_count += 1;
            entry.value = serde_json::to_string(&exit)?;
            exits.push(exit);
        }
        Ok(exits)
    }

    async fn remove_pending_exit(
        &self,
        source_account: &str,
        source_position: &str,
    ) -> Result<()> {
        self.del(&pending_key(source_account, source_position)).await
    }

    async fn mark_orphan_notified(&self, account: &str, position: &str) -> Result<()> {
        self.set(orphan_key(account, position), "1".to_string(), MARKER_TTL_SECS)
            .await
    }

    async fn was_orphan_notified(&self, account: &str, position: &str) -> Result<bool> {
        Ok(self.get(&orphan_key(account, position)).await?.is_some())
    }

    async fn mark_alert_sent(&self, alert_id: &str, ttl_secs: u64) -> Result<()> {
        self.set(alert_key(alert_id), "1".to_string(), ttl_secs).await
    }

    async fn was_alert_sent(&self, alert_id: &str) -> Result<bool> {
        Ok(self.get(&alert_key(alert_id)).await?.is_some())
    }

    async fn write_hour_metrics(
        &self,
        route_id: &str,
        bucket: &str,
        fields: &[(String, String)],
    ) -> Result<()> {
        let payload = serde_json::to_string(&fields.iter().cloned().collect::<HashMap<_, _>>())?;
        self.set(hour_metrics_key(route_id, bucket), payload, HOUR_METRICS_TTL_SECS)
            .await
    }

    async fn write_day_metrics(
        &self,
        route_id: &str,
        bucket: &str,
        fields: &[(String, String)],
    ) -> Result<()> {
        let payload = serde_json::to_string(&fields.iter().cloned().collect::<HashMap<_, _>>())?;
        self.set(day_metrics_key(route_id, bucket), payload, DAY_METRICS_TTL_SECS)
            .await
    }

    async fn write_perf_window(&self, route_id: &str, window: &str, payload: &str) -> Result<()> {
        self.set(perf_key(route_id, window), payload.to_string(), PERF_WINDOW_TTL_SECS)
            .await
    }

    async fn put_report(&self, key: &str, payload: &str) -> Result<()> {
        self.set(key.to_string(), payload.to_string(), REPORT_TTL_SECS)
            .await
    }

    async fn put_stats_snapshot(&self, payload: &str) -> Result<()> {
        self.set(
            STATS_SNAPSHOT_KEY.to_string(),
            payload.to_string(),
            STATS_SNAPSHOT_TTL_SECS,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn mapping(src: &str, pid: &str) -> PositionMapping {
        PositionMapping {
            source_account_id: src.to_string(),
            source_position_id: pid.to_string(),
            dest_account_id: "dest".to_string(),
            dest_position_id: format!("d-{pid}"),
            symbol: "EURUSD".to_string(),
            source_volume: Decimal::new(50, 2),
            dest_volume: Decimal::new(100, 2),
            opened_at: Utc::now(),
            source_open_price: Decimal::new(110000, 5),
            dest_open_price: Decimal::new(110002, 5),
        }
    }

    #[tokio::test]
    async fn test_mapping_roundtrip_and_delete() {
        let store = MemoryStore::new();
        let m = mapping("a1", "p1");

        store.put_mapping(&m).await.unwrap();
        assert_eq!(store.get_mapping("a1", "p1").await.unwrap(), Some(m.clone()));

        store.delete_mapping("a1", "p1").await.unwrap();
        assert_eq!(store.get_mapping("a1", "p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_mappings_scoped_to_account() {
        let store = MemoryStore::new();
        store.put_mapping(&mapping("a1", "p1")).await.unwrap();
        store.put_mapping(&mapping("a1", "p2")).await.unwrap();
        store.put_mapping(&mapping("a2", "p3")).await.unwrap();

        let listed = store.list_mappings("a1").await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_exit_retry_count_increments_on_list() {
        let store = MemoryStore::new();
        store
            .queue_pending_exit(&PendingExit::new(mapping("a1", "p1")))
            .await
            .unwrap();

        let first = store.list_pending_exits("a1").await.unwrap();
        assert_eq!(first[0].retry_count, 1);

        let second = store.list_pending_exits("a1").await.unwrap();
        assert_eq!(second[0].retry_count, 2);
    }

    #[tokio::test]
    async fn test_markers_are_idempotent() {
        let store = MemoryStore::new();
        assert!(!store.was_recently_closed("b", "p").await.unwrap());

        store.mark_closed("b", "p").await.unwrap();
        store.mark_closed("b", "p").await.unwrap();
        assert!(store.was_recently_closed("b", "p").await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_simulation() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = store.get_mapping("a1", "p1").await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));

        store.set_available(true);
        assert_eq!(store.get_mapping("a1", "p1").await.unwrap(), None);
    }
}
