//! Redis-backed implementation of the state store.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::*;
use crate::types::{PendingExit, PositionMapping};
use crate::{Error, Result};

/// State store over a shared `ConnectionManager`. The manager
/// reconnects internally; anything it still fails on is surfaced as
/// `StoreUnavailable`.
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        debug!(url = %redis_url, "Connected state store");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(Duration::from_secs(STORE_OP_TIMEOUT_SECS), fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::StoreUnavailable(
                "store operation timed out".to_string(),
            )),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn set_marker(&self, key: String, ttl_secs: u64) -> Result<()> {
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.set_ex(&key, "1", ttl_secs).await?;
            Ok(())
        })
        .await
    }

    async fn marker_exists(&self, key: String) -> Result<bool> {
        self.timed(async {
            let mut conn = self.conn.clone();
            let exists: bool = conn.exists(&key).await?;
            Ok(exists)
        })
        .await
    }

    async fn write_hash(
        &self,
        key: String,
        fields: &[(String, String)],
        ttl_secs: u64,
    ) -> Result<()> {
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.hset_multiple(&key, fields).await?;
            let _: () = conn.expire(&key, ttl_secs as i64).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn put_mapping(&self, mapping: &PositionMapping) -> Result<()> {
        let key = mapping_key(&mapping.source_account_id, &mapping.source_position_id);
        let payload = serde_json::to_string(mapping)?;
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.set_ex(&key, payload, MAPPING_TTL_SECS).await?;
            Ok(())
        })
        .await
    }

    async fn get_mapping(
        &self,
        source_account: &str,
        source_position: &str,
    ) -> Result<Option<PositionMapping>> {
        let key = mapping_key(source_account, source_position);
        self.timed(async {
            let mut conn = self.conn.clone();
            let payload: Option<String> = conn.get(&key).await?;
            match payload {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn delete_mapping(&self, source_account: &str, source_position: &str) -> Result<()> {
        let key = mapping_key(source_account, source_position);
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.del(&key).await?;
            Ok(())
        })
        .await
    }

    async fn list_mappings(&self, source_account: &str) -> Result<Vec<PositionMapping>> {
        let pattern = format!("map:{source_account}:*");
        self.timed(async {
            let keys = self.scan_keys(&pattern).await?;
            let mut conn = self.conn.clone();
            let mut mappings = Vec::with_capacity(keys.len());
            for key in keys {
                let payload: Option<String> = conn.get(&key).await?;
                if let Some(json) = payload {
                    match serde_json::from_str(&json) {
                        Ok(mapping) => mappings.push(mapping),
                        Err(e) => warn!(key = %key, error = %e, "Skipping unparseable mapping"),
                    }
                }
            }
            Ok(mappings)
        })
        .await
    }

    async fn mark_closed(&self, account: &str, position: &str) -> Result<()> {
        self.set_marker(closed_key(account, position), MARKER_TTL_SECS)
            .await
    }

    async fn was_recently_closed(&self, account: &str, position: &str) -> Result<bool> {
        self.marker_exists(closed_key(account, position)).await
    }

    async fn queue_pending_exit(&self, exit: &PendingExit) -> Result<()> {
        let key = pending_key(
            &exit.mapping.source_account_id,
            &exit.mapping.source_position_id,
        );
        let payload = serde_json::to_string(exit)?;
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.set_ex(&key, payload, PENDING_EXIT_TTL_SECS).await?;
            Ok(())
        })
        .await
    }

    async fn list_pending_exits(&self, source_account: &str) -> Result<Vec<PendingExit>> {
        let pattern = format!("pending:{source_account}:*");
        self.timed(async {
            let keys = self.scan_keys(&pattern).await?;
            let mut conn = self.conn.clone();
            let mut exits = Vec::with_capacity(keys.len());
            for key in keys {
                let payload: Option<String> = conn.get(&key).await?;
                let Some(json) = payload else { continue };
                let mut exit: PendingExit = match serde_json::from_str(&json) {
                    Ok(exit) => exit,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Skipping unparseable pending exit");
                        continue;
                    }
                };
                // Bump the retry counter in place, keeping the original TTL.
                exit.retry_count += 1;
                let remaining: i64 = conn.ttl(&key).await?;
                let updated = serde_json::to_string(&exit)?;
                let _: () = conn
                    .set_ex(&key, updated, remaining.max(1) as u64)
                    .await?;
                exits.push(exit);
            }
            Ok(exits)
        })
        .await
    }

    async fn remove_pending_exit(
        &self,
        source_account: &str,
        source_position: &str,
    ) -> Result<()> {
        let key = pending_key(source_account, source_position);
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.del(&key).await?;
            Ok(())
        })
        .await
    }

    async fn mark_orphan_notified(&self, account: &str, position: &str) -> Result<()> {
        self.set_marker(orphan_key(account, position), MARKER_TTL_SECS)
            .await
    }

    async fn was_orphan_notified(&self, account: &str, position: &str) -> Result<bool> {
        self.marker_exists(orphan_key(account, position)).await
    }

    async fn mark_alert_sent(&self, alert_id: &str, ttl_secs: u64) -> Result<()> {
        self.set_marker(alert_key(alert_id), ttl_secs).await
    }

    async fn was_alert_sent(&self, alert_id: &str) -> Result<bool> {
        self.marker_exists(alert_key(alert_id)).await
    }

    async fn write_hour_metrics(
        &self,
        route_id: &str,
        bucket: &str,
        fields: &[(String, String)],
    ) -> Result<()> {
        self.write_hash(
            hour_metrics_key(route_id, bucket),
            fields,
            HOUR_METRICS_TTL_SECS,
        )
        .await
    }

    async fn write_day_metrics(
        &self,
        route_id: &str,
        bucket: &str,
        fields: &[(String, String)],
    ) -> Result<()> {
        self.write_hash(
            day_metrics_key(route_id, bucket),
            fields,
            DAY_METRICS_TTL_SECS,
        )
        .await
    }

    async fn write_perf_window(&self, route_id: &str, window: &str, payload: &str) -> Result<()> {
        let key = perf_key(route_id, window);
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.set_ex(&key, payload, PERF_WINDOW_TTL_SECS).await?;
            Ok(())
        })
        .await
    }

    async fn put_report(&self, key: &str, payload: &str) -> Result<()> {
        let key = key.to_string();
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn.set_ex(&key, payload, REPORT_TTL_SECS).await?;
            Ok(())
        })
        .await
    }

    async fn put_stats_snapshot(&self, payload: &str) -> Result<()> {
        self.timed(async {
            let mut conn = self.conn.clone();
            let _: () = conn
                .set_ex(STATS_SNAPSHOT_KEY, payload, STATS_SNAPSHOT_TTL_SECS)
                .await?;
            Ok(())
        })
        .await
    }
}
