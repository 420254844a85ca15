//! Alert conditions evaluated over worker snapshots.

use chrono::{DateTime, Utc};
use copy_core::types::WorkerStats;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSettings {
    /// Fraction of the route's daily loss limit that triggers a
    /// warning (e.g. 0.8).
    pub prop_firm_warning_threshold: Decimal,
    /// Consecutive losing exits before an alert.
    pub consecutive_loss_alert: u32,
    /// |expected - actual| open price above this many pips alerts.
    pub slippage_threshold_pips: Decimal,
    /// Heartbeat age that counts as a lost connection.
    pub heartbeat_timeout_secs: i64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            prop_firm_warning_threshold: Decimal::new(8, 1),
            consecutive_loss_alert: 3,
            slippage_threshold_pips: Decimal::new(5, 0),
            heartbeat_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A raised alert. `id` is stable for the underlying condition so the
/// store's alert markers can deduplicate repeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Evaluate every alert condition for one route snapshot.
pub fn evaluate_alerts(
    stats: &WorkerStats,
    settings: &AlertSettings,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let route = &stats.route_id;

    if stats.daily_loss_limit > Decimal::ZERO {
        let warning_level = stats.daily_loss_limit * settings.prop_firm_warning_threshold;
        if stats.daily.daily_loss >= warning_level {
            alerts.push(Alert {
                id: format!("daily-loss:{route}:{}", stats.daily.date),
                severity: AlertSeverity::Warning,
                message: format!(
                    "Route {route}: daily loss {} at {}% of the {} limit",
                    stats.daily.daily_loss,
                    settings.prop_firm_warning_threshold * Decimal::new(100, 0),
                    stats.daily_loss_limit
                ),
            });
        }
    }

    if settings.consecutive_loss_alert > 0
        && stats.consecutive_losses >= settings.consecutive_loss_alert
    {
        alerts.push(Alert {
            id: format!(
                "consecutive-losses:{route}:{}:{}",
                stats.daily.date, stats.consecutive_losses
            ),
            severity: AlertSeverity::Warning,
            message: format!(
                "Route {route}: {} consecutive losing exits",
                stats.consecutive_losses
            ),
        });
    }

    if let Some(slippage) = stats.last_slippage_pips {
        if slippage > settings.slippage_threshold_pips {
            let trade_stamp = stats
                .last_trade_at
                .map(|t| t.timestamp().to_string())
                .unwrap_or_default();
            alerts.push(Alert {
                id: format!("slippage:{route}:{trade_stamp}"),
                severity: AlertSeverity::Warning,
                message: format!(
                    "Route {route}: {} pips slippage on the latest copy",
                    slippage
                ),
            });
        }
    }

    let heartbeat_age = (now - stats.heartbeat).num_seconds();
    if stats.running && heartbeat_age > settings.heartbeat_timeout_secs {
        alerts.push(Alert {
            id: format!("connection-lost:{route}"),
            severity: AlertSeverity::Critical,
            message: format!(
                "Route {route}: worker heartbeat is {heartbeat_age}s old, connection may be lost"
            ),
        });
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stats() -> WorkerStats {
        let mut stats = WorkerStats::new("r1", Utc::now());
        stats.daily_loss_limit = Decimal::new(1000, 0);
        stats
    }

    #[test]
    fn test_quiet_route_raises_nothing() {
        let alerts = evaluate_alerts(&stats(), &AlertSettings::default(), Utc::now());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_daily_loss_warning_at_threshold() {
        let mut s = stats();
        s.daily.daily_loss = Decimal::new(800, 0);

        let alerts = evaluate_alerts(&s, &AlertSettings::default(), Utc::now());
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].id.starts_with("daily-loss:r1:"));
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_consecutive_loss_alert() {
        let mut s = stats();
        s.consecutive_losses = 3;

        let alerts = evaluate_alerts(&s, &AlertSettings::default(), Utc::now());
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].id.starts_with("consecutive-losses:r1:"));
    }

    #[test]
    fn test_slippage_alert_above_threshold() {
        let mut s = stats();
        s.last_slippage_pips = Some(Decimal::new(7, 0));
        s.last_trade_at = Some(Utc::now());

        let alerts = evaluate_alerts(&s, &AlertSettings::default(), Utc::now());
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].id.starts_with("slippage:r1:"));
    }

    #[test]
    fn test_stale_heartbeat_is_critical() {
        let s = stats();
        let later = Utc::now() + Duration::seconds(600);

        let alerts = evaluate_alerts(&s, &AlertSettings::default(), later);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(alerts[0].id, "connection-lost:r1");
    }

    #[test]
    fn test_stopped_worker_does_not_alert_on_heartbeat() {
        let mut s = stats();
        s.running = false;
        let later = Utc::now() + Duration::seconds(600);

        let alerts = evaluate_alerts(&s, &AlertSettings::default(), later);
        assert!(alerts.is_empty());
    }
}
