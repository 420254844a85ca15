//! Ordered, named filter pipeline over copy candidates.
//!
//! Filters are pure functions over a candidate position and an
//! already-resolved route-state snapshot; they never perform I/O. The
//! pipeline short-circuits on the first rejection for the decision,
//! and can collect every rejection for route-level logging.

use chrono::{DateTime, Timelike, Utc};
use copy_core::types::{Position, RuleSet};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;

use crate::state::RouteState;

pub const ALREADY_PROCESSED: &str = "already-processed";
pub const DAILY_LOSS_GUARD: &str = "daily-loss-guard";
pub const MAX_CONCURRENT_CYCLES: &str = "max-concurrent-cycles";
pub const MIN_INTERVAL: &str = "min-interval";
pub const DAILY_TRADE_CAP: &str = "daily-trade-cap";
pub const TRADING_HOURS: &str = "trading-hours";
pub const MARTINGALE_BASE_MULTIPLE: &str = "martingale-base-multiple";
pub const GRID_CLUSTER: &str = "grid-cluster";

const KNOWN_FILTERS: &[&str] = &[
    ALREADY_PROCESSED,
    DAILY_LOSS_GUARD,
    MAX_CONCURRENT_CYCLES,
    MIN_INTERVAL,
    DAILY_TRADE_CAP,
    TRADING_HOURS,
    MARTINGALE_BASE_MULTIPLE,
    GRID_CLUSTER,
];

/// Parameters for one configured filter, as loose JSON from the
/// routing config. Each filter parses what it needs and falls back to
/// its defaults.
pub type FilterParams = serde_json::Map<String, Value>;

pub fn is_known_filter(name: &str) -> bool {
    KNOWN_FILTERS.contains(&name)
}

pub fn known_filters() -> &'static [&'static str] {
    KNOWN_FILTERS
}

/// Everything a filter may look at.
pub struct FilterInput<'a> {
    pub candidate: &'a Position,
    pub state: &'a RouteState,
    pub rule: &'a RuleSet,
    pub now: DateTime<Utc>,
}

enum Verdict {
    Accept,
    Reject(String),
}

/// Outcome of a pipeline evaluation. `rejections` holds one entry for
/// a short-circuited run, or every rejection for a traced run.
#[derive(Debug, Clone)]
pub struct FilterDecision {
    pub accepted: bool,
    pub rejections: Vec<(String, String)>,
}

impl FilterDecision {
    fn accept() -> Self {
        Self {
            accepted: true,
            rejections: Vec::new(),
        }
    }
}

/// Ordered list of named filters, evaluated in config order.
pub struct FilterPipeline {
    filters: Vec<(String, FilterParams)>,
}

impl FilterPipeline {
    /// Build from a rule set's filter list and the config's filter
    /// definitions. Unknown names must already have been rejected by
    /// config validation.
    pub fn new(names: &[String], definitions: &HashMap<String, FilterParams>) -> Self {
        let filters = names
            .iter()
            .map(|name| {
                let params = definitions.get(name).cloned().unwrap_or_default();
                (name.clone(), params)
            })
            .collect();
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Evaluate with short-circuit: stops at the first rejection.
    pub fn evaluate(&self, input: &FilterInput<'_>) -> FilterDecision {
        for (name, params) in &self.filters {
            if let Verdict::Reject(reason) = run_filter(name, input, params) {
                return FilterDecision {
                    accepted: false,
                    rejections: vec![(name.clone(), reason)],
                };
            }
        }
        FilterDecision::accept()
    }

    /// Evaluate collecting every rejection, for observability.
    pub fn evaluate_traced(&self, input: &FilterInput<'_>) -> FilterDecision {
        let mut rejections = Vec::new();
        for (name, params) in &self.filters {
            if let Verdict::Reject(reason) = run_filter(name, input, params) {
                rejections.push((name.clone(), reason));
            }
        }
        FilterDecision {
            accepted: rejections.is_empty(),
            rejections,
        }
    }
}

fn run_filter(name: &str, input: &FilterInput<'_>, params: &FilterParams) -> Verdict {
    match name {
        ALREADY_PROCESSED => already_processed(input),
        DAILY_LOSS_GUARD => daily_loss_guard(input),
        MAX_CONCURRENT_CYCLES => max_concurrent_cycles(input),
        MIN_INTERVAL => min_interval(input, params),
        DAILY_TRADE_CAP => daily_trade_cap(input),
        TRADING_HOURS => trading_hours(input, params),
        MARTINGALE_BASE_MULTIPLE => martingale_base_multiple(input, params),
        GRID_CLUSTER => grid_cluster(input, params),
        // Unknown names are a config-validation bug; accept rather
        // than silently blocking the route.
        _ => Verdict::Accept,
    }
}

fn already_processed(input: &FilterInput<'_>) -> Verdict {
    if input
        .state
        .processed_trade_ids
        .contains(&input.candidate.id)
    {
        Verdict::Reject(format!("position {} already handled today", input.candidate.id))
    } else {
        Verdict::Accept
    }
}

fn daily_loss_guard(input: &FilterInput<'_>) -> Verdict {
    let guard_level = input.rule.max_daily_loss * Decimal::new(8, 1);
    if input.state.daily_stats.daily_loss >= guard_level {
        Verdict::Reject(format!(
            "daily loss {} at 80% of the {} limit",
            input.state.daily_stats.daily_loss, input.rule.max_daily_loss
        ))
    } else {
        Verdict::Accept
    }
}

fn max_concurrent_cycles(input: &FilterInput<'_>) -> Verdict {
    let active = input.state.active_cycles.len();
    if active >= input.rule.max_concurrent_cycles {
        Verdict::Reject(format!(
            "{active} active cycles at the {} cap",
            input.rule.max_concurrent_cycles
        ))
    } else {
        Verdict::Accept
    }
}

fn min_interval(input: &FilterInput<'_>, params: &FilterParams) -> Verdict {
    let min_ms = param_i64(params, "minIntervalMs")
        .unwrap_or(input.rule.min_time_between_trades_ms);
    if min_ms <= 0 || input.state.last_trade_epoch_ms == 0 {
        return Verdict::Accept;
    }
    let elapsed = input.now.timestamp_millis() - input.state.last_trade_epoch_ms;
    if elapsed < min_ms {
        Verdict::Reject(format!("{elapsed}ms since last trade, need {min_ms}ms"))
    } else {
        Verdict::Accept
    }
}

fn daily_trade_cap(input: &FilterInput<'_>) -> Verdict {
    if input.state.daily_stats.trades >= input.rule.max_daily_trades {
        Verdict::Reject(format!(
            "{} trades at the daily cap",
            input.state.daily_stats.trades
        ))
    } else {
        Verdict::Accept
    }
}

fn trading_hours(input: &FilterInput<'_>, params: &FilterParams) -> Verdict {
    let Some(allowed) = param_hours(params, "allowedUtcHours") else {
        return Verdict::Accept;
    };
    if allowed.is_empty() {
        return Verdict::Accept;
    }
    let hour = input.now.hour();
    if allowed.contains(&hour) {
        Verdict::Accept
    } else {
        Verdict::Reject(format!("UTC hour {hour} outside allowed trading hours"))
    }
}

fn martingale_base_multiple(input: &FilterInput<'_>, params: &FilterParams) -> Verdict {
    let base_lots = param_decimal(params, "baseLots").unwrap_or_else(|| Decimal::new(1, 2));
    let threshold =
        param_decimal(params, "multipleThreshold").unwrap_or_else(|| Decimal::new(17, 1));
    let cutoff = base_lots * threshold;
    if input.candidate.volume > cutoff {
        Verdict::Reject(format!(
            "volume {} exceeds {cutoff} ({}x base), likely a martingale leg",
            input.candidate.volume, threshold
        ))
    } else {
        Verdict::Accept
    }
}

fn grid_cluster(input: &FilterInput<'_>, params: &FilterParams) -> Verdict {
    let cluster_pips = param_decimal(params, "priceClusterPips").unwrap_or_else(|| Decimal::new(20, 0));
    let neighbours = input.state.cluster_neighbours(input.candidate, cluster_pips);
    if neighbours >= 2 {
        Verdict::Reject(format!(
            "{neighbours} open {} positions within {cluster_pips} pips, likely a grid",
            input.candidate.symbol
        ))
    } else {
        Verdict::Accept
    }
}

fn param_decimal(params: &FilterParams, key: &str) -> Option<Decimal> {
    match params.get(key)? {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn param_i64(params: &FilterParams, key: &str) -> Option<i64> {
    match params.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn param_hours(params: &FilterParams, key: &str) -> Option<Vec<u32>> {
    let Value::Array(values) = params.get(key)? else {
        return None;
    };
    Some(
        values
            .iter()
            .filter_map(|v| v.as_u64().map(|h| h as u32))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use copy_core::types::{Side, SizingMode};

    fn rule() -> RuleSet {
        RuleSet {
            name: "test".to_string(),
            sizing: SizingMode::Proportional {
                multiplier: Decimal::ONE,
            },
            max_daily_trades: 5,
            max_daily_loss: Decimal::new(1000, 0),
            min_time_between_trades_ms: 60_000,
            max_open_positions: 10,
            max_concurrent_cycles: 2,
            filters: vec![],
        }
    }

    fn candidate(id: &str, volume: Decimal) -> Position {
        Position {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume,
            open_price: Decimal::new(11000, 4),
            current_price: Decimal::new(11000, 4),
            stop_loss: None,
            take_profit: None,
            profit: Decimal::ZERO,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        }
    }

    fn pipeline(names: &[&str], defs: HashMap<String, FilterParams>) -> FilterPipeline {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        FilterPipeline::new(&names, &defs)
    }

    #[test]
    fn test_known_filter_registry() {
        assert!(is_known_filter("already-processed"));
        assert!(is_known_filter("grid-cluster"));
        assert!(!is_known_filter("no-such-filter"));
    }

    #[test]
    fn test_already_processed_rejects_seen_ids() {
        let rule = rule();
        let mut state = RouteState::new(Utc::now());
        state.processed_trade_ids.insert("7".to_string());
        let p = candidate("7", Decimal::new(10, 2));

        let decision = pipeline(&[ALREADY_PROCESSED], HashMap::new()).evaluate(&FilterInput {
            candidate: &p,
            state: &state,
            rule: &rule,
            now: Utc::now(),
        });

        assert!(!decision.accepted);
        assert_eq!(decision.rejections[0].0, ALREADY_PROCESSED);
    }

    #[test]
    fn test_min_interval_rejects_until_elapsed() {
        let rule = rule();
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).unwrap();
        let mut state = RouteState::new(now);
        state.last_trade_epoch_ms = now.timestamp_millis() - 10_000;
        let p = candidate("1", Decimal::new(10, 2));

        let pipe = pipeline(&[MIN_INTERVAL], HashMap::new());
        let decision = pipe.evaluate(&FilterInput {
            candidate: &p,
            state: &state,
            rule: &rule,
            now,
        });
        assert!(!decision.accepted);

        state.last_trade_epoch_ms = now.timestamp_millis() - 120_000;
        let decision = pipe.evaluate(&FilterInput {
            candidate: &p,
            state: &state,
            rule: &rule,
            now,
        });
        assert!(decision.accepted);
    }

    #[test]
    fn test_min_interval_accepts_first_trade() {
        let rule = rule();
        let state = RouteState::new(Utc::now());
        let p = candidate("1", Decimal::new(10, 2));

        let decision = pipeline(&[MIN_INTERVAL], HashMap::new()).evaluate(&FilterInput {
            candidate: &p,
            state: &state,
            rule: &rule,
            now: Utc::now(),
        });
        assert!(decision.accepted);
    }

    #[test]
    fn test_daily_loss_guard_trips_at_eighty_percent() {
        let rule = rule();
        let mut state = RouteState::new(Utc::now());
        state.daily_stats.daily_loss = Decimal::new(800, 0);
        let p = candidate("1", Decimal::new(10, 2));

        let decision = pipeline(&[DAILY_LOSS_GUARD], HashMap::new()).evaluate(&FilterInput {
            candidate: &p,
            state: &state,
            rule: &rule,
            now: Utc::now(),
        });
        assert!(!decision.accepted);
    }

    #[test]
    fn test_trading_hours_filter() {
        let rule = rule();
        let state = RouteState::new(Utc::now());
        let p = candidate("1", Decimal::new(10, 2));
        let mut defs = HashMap::new();
        let mut params = FilterParams::new();
        params.insert(
            "allowedUtcHours".to_string(),
            serde_json::json!([8, 9, 10, 11, 12, 13, 14, 15, 16]),
        );
        defs.insert(TRADING_HOURS.to_string(), params);
        let pipe = pipeline(&[TRADING_HOURS], defs);

        let in_hours = Utc.with_ymd_and_hms(2025, 11, 3, 10, 30, 0).unwrap();
        assert!(pipe
            .evaluate(&FilterInput {
                candidate: &p,
                state: &state,
                rule: &rule,
                now: in_hours,
            })
            .accepted);

        let after_hours = Utc.with_ymd_and_hms(2025, 11, 3, 22, 30, 0).unwrap();
        assert!(!pipe
            .evaluate(&FilterInput {
                candidate: &p,
                state: &state,
                rule: &rule,
                now: after_hours,
            })
            .accepted);
    }

    #[test]
    fn test_martingale_base_multiple_default_threshold() {
        let rule = rule();
        let state = RouteState::new(Utc::now());
        let mut defs = HashMap::new();
        let mut params = FilterParams::new();
        params.insert("baseLots".to_string(), serde_json::json!("0.10"));
        defs.insert(MARTINGALE_BASE_MULTIPLE.to_string(), params);
        let pipe = pipeline(&[MARTINGALE_BASE_MULTIPLE], defs);

        // 0.10 * 1.7 = 0.17 cutoff
        let ok = candidate("1", Decimal::new(17, 2));
        assert!(pipe
            .evaluate(&FilterInput {
                candidate: &ok,
                state: &state,
                rule: &rule,
                now: Utc::now(),
            })
            .accepted);

        let escalated = candidate("2", Decimal::new(20, 2));
        assert!(!pipe
            .evaluate(&FilterInput {
                candidate: &escalated,
                state: &state,
                rule: &rule,
                now: Utc::now(),
            })
            .accepted);
    }

    #[test]
    fn test_short_circuit_vs_traced() {
        let rule = rule();
        let mut state = RouteState::new(Utc::now());
        state.processed_trade_ids.insert("1".to_string());
        state.daily_stats.trades = 5; // also at the trade cap
        let p = candidate("1", Decimal::new(10, 2));

        let pipe = pipeline(&[ALREADY_PROCESSED, DAILY_TRADE_CAP], HashMap::new());
        let input = FilterInput {
            candidate: &p,
            state: &state,
            rule: &rule,
            now: Utc::now(),
        };

        assert_eq!(pipe.evaluate(&input).rejections.len(), 1);
        assert_eq!(pipe.evaluate_traced(&input).rejections.len(), 2);
    }
}
