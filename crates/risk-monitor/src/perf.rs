//! Performance monitor: time-bucketed metrics, alert evaluation, and
//! scheduled summaries over worker snapshots.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use copy_core::notifier::Notifier;
use copy_core::store::StateStore;
use copy_core::types::WorkerStats;
use copy_engine::WorkerHandle;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::alerts::{evaluate_alerts, AlertSettings, AlertSeverity};

const PERF_WINDOWS: &[&str] = &["1h", "24h", "7d", "30d"];

#[derive(Debug, Clone)]
pub struct PerfMonitorConfig {
    pub metrics_interval_secs: u64,
    pub alert_interval_secs: u64,
    pub daily_summary_time_utc: NaiveTime,
    pub weekly_summary_day: Weekday,
    /// How long an alert marker suppresses repeats.
    pub alert_marker_ttl_secs: u64,
}

impl Default for PerfMonitorConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 60,
            alert_interval_secs: 30,
            daily_summary_time_utc: NaiveTime::from_hms_opt(21, 0, 0)
                .expect("valid constant time"),
            weekly_summary_day: Weekday::Sun,
            alert_marker_ttl_secs: 3600,
        }
    }
}

pub struct PerfMonitor {
    workers: Arc<DashMap<String, Arc<WorkerHandle>>>,
    store: Arc<dyn StateStore>,
    notifier: Arc<Notifier>,
    alert_settings: AlertSettings,
    config: PerfMonitorConfig,
    active: RwLock<bool>,
    last_daily_report: RwLock<Option<NaiveDate>>,
    last_weekly_report: RwLock<Option<NaiveDate>>,
}

impl PerfMonitor {
    pub fn new(
        workers: Arc<DashMap<String, Arc<WorkerHandle>>>,
        store: Arc<dyn StateStore>,
        notifier: Arc<Notifier>,
        alert_settings: AlertSettings,
        config: PerfMonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers,
            store,
            notifier,
            alert_settings,
            config,
            active: RwLock::new(false),
            last_daily_report: RwLock::new(None),
            last_weekly_report: RwLock::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        {
            let mut active = self.active.write().await;
            if *active {
                return;
            }
            *active = true;
        }

        info!(
            metrics_secs = self.config.metrics_interval_secs,
            alert_secs = self.config.alert_interval_secs,
            "Starting performance monitor"
        );

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut metrics_tick =
                interval(Duration::from_secs(monitor.config.metrics_interval_secs));
            let mut alert_tick = interval(Duration::from_secs(monitor.config.alert_interval_secs));
            metrics_tick.tick().await;
            alert_tick.tick().await;

            loop {
                tokio::select! {
                    _ = metrics_tick.tick() => {
                        if !*monitor.active.read().await {
                            break;
                        }
                        monitor.write_metrics_once(Utc::now()).await;
                        monitor.maybe_generate_summaries(Utc::now()).await;
                    }
                    _ = alert_tick.tick() => {
                        if !*monitor.active.read().await {
                            break;
                        }
                        monitor.evaluate_alerts_once(Utc::now()).await;
                    }
                }
            }
            info!("Performance monitor stopped");
        });
    }

    pub async fn stop(&self) {
        *self.active.write().await = false;
    }

    async fn snapshots(&self) -> Vec<WorkerStats> {
        let mut out = Vec::with_capacity(self.workers.len());
        for entry in self.workers.iter() {
            out.push(entry.value().stats().await);
        }
        out
    }

    /// Write hour and day metric hashes plus the short-TTL perf window
    /// caches for every route.
    pub async fn write_metrics_once(&self, now: DateTime<Utc>) {
        let hour_bucket = now.format("%Y-%m-%dT%H").to_string();
        let day_bucket = now.format("%Y-%m-%d").to_string();

        for stats in self.snapshots().await {
            let fields = vec![
                ("trades".to_string(), stats.daily.trades.to_string()),
                ("profit".to_string(), stats.gross_profit.to_string()),
                ("loss".to_string(), stats.gross_loss.to_string()),
                ("positions".to_string(), stats.open_mappings.to_string()),
                ("winRate".to_string(), stats.win_rate().to_string()),
                ("profitFactor".to_string(), stats.profit_factor().to_string()),
            ];

            if let Err(e) = self
                .store
                .write_hour_metrics(&stats.route_id, &hour_bucket, &fields)
                .await
            {
                error!(route_id = %stats.route_id, error = %e, "Hour metrics write failed");
            }
            if let Err(e) = self
                .store
                .write_day_metrics(&stats.route_id, &day_bucket, &fields)
                .await
            {
                error!(route_id = %stats.route_id, error = %e, "Day metrics write failed");
            }

            for window in PERF_WINDOWS {
                let payload = serde_json::json!({
                    "window": window,
                    "asOf": now.to_rfc3339(),
                    "stats": stats,
                });
                if let Err(e) = self
                    .store
                    .write_perf_window(&stats.route_id, window, &payload.to_string())
                    .await
                {
                    debug!(route_id = %stats.route_id, error = %e, "Perf window write failed");
                }
            }
        }
    }

    /// Evaluate alert conditions, deduplicating through the store's
    /// alert markers.
    pub async fn evaluate_alerts_once(&self, now: DateTime<Utc>) {
        for stats in self.snapshots().await {
            for alert in evaluate_alerts(&stats, &self.alert_settings, now) {
                match self.store.was_alert_sent(&alert.id).await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => {
                        debug!(alert_id = %alert.id, error = %e, "Alert marker unreadable");
                        continue;
                    }
                }

                match alert.severity {
                    AlertSeverity::Critical => self.notifier.critical(&alert.message).await,
                    AlertSeverity::Warning => self.notifier.warning(&alert.message).await,
                };

                if let Err(e) = self
                    .store
                    .mark_alert_sent(&alert.id, self.config.alert_marker_ttl_secs)
                    .await
                {
                    debug!(alert_id = %alert.id, error = %e, "Alert marker write failed");
                }
            }
        }
    }

    /// Emit the daily and weekly summaries once their configured UTC
    /// times pass.
    pub async fn maybe_generate_summaries(&self, now: DateTime<Utc>) {
        let today = now.date_naive();

        if now.time() >= self.config.daily_summary_time_utc {
            let already = *self.last_daily_report.read().await == Some(today);
            if !already {
                self.generate_summary(&format!("report:daily:{today}"), "Daily", now)
                    .await;
                *self.last_daily_report.write().await = Some(today);
            }
        }

        if now.weekday() == self.config.weekly_summary_day
            && now.time() >= self.config.daily_summary_time_utc
        {
            let monday = today
                .checked_sub_days(Days::new(today.weekday().num_days_from_monday() as u64))
                .unwrap_or(today);
            let already = *self.last_weekly_report.read().await == Some(monday);
            if !already {
                self.generate_summary(&format!("report:weekly:{monday}"), "Weekly", now)
                    .await;
                *self.last_weekly_report.write().await = Some(monday);
            }
        }
    }

    async fn generate_summary(&self, report_key: &str, label: &str, now: DateTime<Utc>) {
        let snapshots = self.snapshots().await;
        let total_trades: u32 = snapshots.iter().map(|s| s.daily.trades).sum();
        let total_profit: Decimal = snapshots.iter().map(|s| s.daily.realized_profit).sum();
        let total_loss: Decimal = snapshots.iter().map(|s| s.daily.daily_loss).sum();

        let mut lines = vec![format!(
            "{label} summary ({}): {} routes, {} trades, P/L {}, losses {}",
            now.format("%Y-%m-%d"),
            snapshots.len(),
            total_trades,
            total_profit,
            total_loss
        )];
        for stats in &snapshots {
            lines.push(format!(
                "  {}: {} trades, P/L {}, win rate {}",
                stats.route_id,
                stats.daily.trades,
                stats.daily.realized_profit,
                stats.win_rate()
            ));
        }
        let text = lines.join("\n");

        let payload = serde_json::json!({
            "generatedAt": now.to_rfc3339(),
            "totalTrades": total_trades,
            "totalProfit": total_profit,
            "totalLoss": total_loss,
            "routes": snapshots,
        });
        if let Err(e) = self.store.put_report(report_key, &payload.to_string()).await {
            error!(report = %report_key, error = %e, "Report write failed");
        }

        info!(report = %report_key, "Generated summary");
        self.notifier.summary(&text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use copy_core::store::MemoryStore;

    fn monitor_with_store() -> (Arc<PerfMonitor>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let monitor = PerfMonitor::new(
            Arc::new(DashMap::new()),
            store.clone(),
            Arc::new(Notifier::disabled()),
            AlertSettings::default(),
            PerfMonitorConfig::default(),
        );
        (monitor, store)
    }

    #[tokio::test]
    async fn test_daily_summary_generated_once_per_day() {
        let (monitor, store) = monitor_with_store();
        let after_nine_pm = Utc.with_ymd_and_hms(2025, 11, 4, 21, 5, 0).unwrap();

        monitor.maybe_generate_summaries(after_nine_pm).await;
        assert!(store.raw_get("report:daily:2025-11-04").await.is_some());

        // A second pass the same evening must not rewrite.
        store.set_available(false);
        monitor.maybe_generate_summaries(after_nine_pm).await;
        store.set_available(true);
    }

    #[tokio::test]
    async fn test_no_summary_before_configured_time() {
        let (monitor, store) = monitor_with_store();
        let morning = Utc.with_ymd_and_hms(2025, 11, 4, 9, 0, 0).unwrap();

        monitor.maybe_generate_summaries(morning).await;
        assert!(store.raw_get("report:daily:2025-11-04").await.is_none());
    }

    #[tokio::test]
    async fn test_weekly_summary_keyed_by_monday() {
        let (monitor, store) = monitor_with_store();
        // 2025-11-09 is a Sunday; its week starts 2025-11-03.
        let sunday_evening = Utc.with_ymd_and_hms(2025, 11, 9, 21, 30, 0).unwrap();

        monitor.maybe_generate_summaries(sunday_evening).await;
        assert!(store.raw_get("report:weekly:2025-11-03").await.is_some());
    }
}
