//! Per-route daily counters and snapshot stats.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Counters scoped to one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: NaiveDate,
    pub trades: u32,
    pub realized_profit: Decimal,
    /// Accumulated losses only, as a positive number.
    pub daily_loss: Decimal,
}

impl DailyStats {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            trades: 0,
            realized_profit: Decimal::ZERO,
            daily_loss: Decimal::ZERO,
        }
    }

    pub fn for_now(now: DateTime<Utc>) -> Self {
        Self::new(now.date_naive())
    }

    /// Record a realized result. Losses accumulate into `daily_loss`.
    pub fn record_result(&mut self, profit: Decimal) {
        self.realized_profit += profit;
        if profit < Decimal::ZERO {
            self.daily_loss += -profit;
        }
    }
}

/// Read-only snapshot a worker exposes to the supervisor and the
/// performance monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub route_id: String,
    pub daily: DailyStats,
    /// The rule set's daily loss cap, for threshold alerts.
    pub daily_loss_limit: Decimal,
    pub open_mappings: usize,
    pub wins: u32,
    pub losses: u32,
    pub gross_profit: Decimal,
    /// Positive number.
    pub gross_loss: Decimal,
    pub consecutive_losses: u32,
    pub last_trade_at: Option<DateTime<Utc>>,
    /// |expected - actual| open price of the latest copy, in pips.
    pub last_slippage_pips: Option<Decimal>,
    /// Last time the worker's event loop made progress.
    pub heartbeat: DateTime<Utc>,
    pub running: bool,
}

impl WorkerStats {
    pub fn new(route_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            route_id: route_id.to_string(),
            daily: DailyStats::for_now(now),
            daily_loss_limit: Decimal::ZERO,
            open_mappings: 0,
            wins: 0,
            losses: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            consecutive_losses: 0,
            last_trade_at: None,
            last_slippage_pips: None,
            heartbeat: now,
            running: true,
        }
    }

    pub fn win_rate(&self) -> Decimal {
        let total = self.wins + self.losses;
        if total == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(total)
    }

    pub fn profit_factor(&self) -> Decimal {
        if self.gross_loss.is_zero() {
            return if self.gross_profit.is_zero() {
                Decimal::ZERO
            } else {
                Decimal::new(999, 0)
            };
        }
        self.gross_profit / self.gross_loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_stats_records_losses_positively() {
        let mut stats = DailyStats::for_now(Utc::now());
        stats.record_result(Decimal::new(120, 0));
        stats.record_result(Decimal::new(-80, 0));

        assert_eq!(stats.realized_profit, Decimal::new(40, 0));
        assert_eq!(stats.daily_loss, Decimal::new(80, 0));
    }

    #[test]
    fn test_win_rate_and_profit_factor() {
        let mut stats = WorkerStats::new("r1", Utc::now());
        stats.wins = 3;
        stats.losses = 1;
        stats.gross_profit = Decimal::new(300, 0);
        stats.gross_loss = Decimal::new(100, 0);

        assert_eq!(stats.win_rate(), Decimal::new(75, 2));
        assert_eq!(stats.profit_factor(), Decimal::new(3, 0));
    }

    #[test]
    fn test_profit_factor_with_no_losses() {
        let mut stats = WorkerStats::new("r1", Utc::now());
        stats.gross_profit = Decimal::new(50, 0);
        assert_eq!(stats.profit_factor(), Decimal::new(999, 0));
    }
}
