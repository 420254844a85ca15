//! In-memory runtime state for one route. Created when the route
//! starts, torn down on stop; the mapping store is the only state that
//! survives restarts.

use chrono::{DateTime, Utc};
use copy_core::types::{pip_size, DailyStats, Position, Side};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Key grouping positions into a heuristic martingale/grid cycle:
/// same symbol, same side.
pub fn cycle_key(symbol: &str, side: Side) -> String {
    match side {
        Side::Buy => format!("{symbol}:buy"),
        Side::Sell => format!("{symbol}:sell"),
    }
}

pub struct RouteState {
    /// Live mirror of the source account's open positions.
    pub source_positions: HashMap<String, Position>,
    /// Source ids already handled this UTC day. Superset of the
    /// currently mapped ids on this route.
    pub processed_trade_ids: HashSet<String>,
    pub daily_stats: DailyStats,
    /// Open positions grouped into heuristic cycles.
    pub active_cycles: HashMap<String, Vec<Position>>,
    pub last_trade_epoch_ms: i64,
}

impl RouteState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            source_positions: HashMap::new(),
            processed_trade_ids: HashSet::new(),
            daily_stats: DailyStats::for_now(now),
            active_cycles: HashMap::new(),
            last_trade_epoch_ms: 0,
        }
    }

    /// Reset daily counters at the UTC day boundary. Must run before
    /// any filter evaluation for an event on the new day.
    pub fn rotate_daily_stats_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if self.daily_stats.date == today {
            return false;
        }
        info!(
            previous_day = %self.daily_stats.date,
            trades = self.daily_stats.trades,
            realized = %self.daily_stats.realized_profit,
            "Rolling daily stats"
        );
        self.daily_stats = DailyStats::new(today);
        self.processed_trade_ids.clear();
        true
    }

    /// Track a source position and slot it into its cycle.
    pub fn track_source_position(&mut self, position: Position) {
        let key = cycle_key(&position.symbol, position.side);
        let cycle = self.active_cycles.entry(key).or_default();
        match cycle.iter_mut().find(|p| p.id == position.id) {
            Some(existing) => *existing = position.clone(),
            None => cycle.push(position.clone()),
        }
        self.source_positions.insert(position.id.clone(), position);
    }

    /// Drop a source position, pruning its cycle when it empties.
    pub fn untrack_source_position(&mut self, position_id: &str) -> Option<Position> {
        let position = self.source_positions.remove(position_id)?;
        let key = cycle_key(&position.symbol, position.side);
        if let Some(cycle) = self.active_cycles.get_mut(&key) {
            cycle.retain(|p| p.id != position_id);
            if cycle.is_empty() {
                self.active_cycles.remove(&key);
            }
        }
        Some(position)
    }

    /// Count open source positions on the same symbol whose open price
    /// sits within `cluster_pips` of the candidate's.
    pub fn cluster_neighbours(&self, candidate: &Position, cluster_pips: Decimal) -> usize {
        let pip = pip_size(&candidate.symbol);
        let radius = cluster_pips * pip;
        self.source_positions
            .values()
            .filter(|p| {
                p.id != candidate.id
                    && p.symbol == candidate.symbol
                    && (p.open_price - candidate.open_price).abs() <= radius
            })
            .count()
    }

    pub fn record_trade(&mut self, now: DateTime<Utc>) {
        self.daily_stats.trades += 1;
        self.last_trade_epoch_ms = now.timestamp_millis();
    }
}
