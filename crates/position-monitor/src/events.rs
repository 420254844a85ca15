//! Position lifecycle events and snapshot diffing.

use copy_core::types::{CloseInfo, Position};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Lifecycle event for one source position. For any one position id,
/// `Opened` precedes zero or more `Updated` which precede at most one
/// terminal `Closed`. No ordering across different ids.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Opened(Position),
    Updated {
        previous: Position,
        current: Position,
    },
    Closed {
        /// Last known snapshot of the position.
        position: Position,
        close_info: CloseInfo,
    },
}

impl PositionEvent {
    pub fn position_id(&self) -> &str {
        match self {
            PositionEvent::Opened(p) => &p.id,
            PositionEvent::Updated { current, .. } => &current.id,
            PositionEvent::Closed { position, .. } => &position.id,
        }
    }
}

/// Profit jitter below this is not worth an `Updated` event.
pub const DEFAULT_PROFIT_NOISE: Decimal = Decimal::from_parts(50, 0, 0, false, 2); // 0.50

/// Diff a freshly fetched position list against the tracked map,
/// producing events and updating the map in place. Used by the polling
/// backend on every tick and by both backends after a reconnect.
pub fn diff_snapshots(
    tracked: &mut HashMap<String, Position>,
    fetched: Vec<Position>,
    profit_noise: Decimal,
) -> Vec<PositionEvent> {
    let mut events = Vec::new();
    let mut seen: HashMap<String, ()> = HashMap::with_capacity(fetched.len());

    for position in fetched {
        seen.insert(position.id.clone(), ());
        match tracked.get(&position.id) {
            None => {
                tracked.insert(position.id.clone(), position.clone());
                events.push(PositionEvent::Opened(position));
            }
            Some(previous) => {
                if materially_changed(previous, &position, profit_noise) {
                    let previous = previous.clone();
                    tracked.insert(position.id.clone(), position.clone());
                    events.push(PositionEvent::Updated {
                        previous,
                        current: position,
                    });
                }
            }
        }
    }

    // Anything tracked but no longer reported is closed; carry the last
    // known snapshot. No deal is available on this path.
    let gone: Vec<String> = tracked
        .keys()
        .filter(|id| !seen.contains_key(*id))
        .cloned()
        .collect();
    for id in gone {
        if let Some(position) = tracked.remove(&id) {
            events.push(PositionEvent::Closed {
                position,
                close_info: CloseInfo::opaque(),
            });
        }
    }

    events
}

pub(crate) fn materially_changed(
    previous: &Position,
    current: &Position,
    profit_noise: Decimal,
) -> bool {
    previous.volume != current.volume
        || previous.stop_loss != current.stop_loss
        || previous.take_profit != current.take_profit
        || (previous.profit - current.profit).abs() > profit_noise
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use copy_core::types::{CloseReason, Side};

    fn position(id: &str, volume: Decimal, profit: Decimal) -> Position {
        Position {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume,
            open_price: Decimal::new(11000, 4),
            current_price: Decimal::new(11010, 4),
            stop_loss: None,
            take_profit: None,
            profit,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        }
    }

    #[test]
    fn test_new_position_emits_opened() {
        let mut tracked = HashMap::new();
        let events = diff_snapshots(
            &mut tracked,
            vec![position("1", Decimal::new(10, 2), Decimal::ZERO)],
            DEFAULT_PROFIT_NOISE,
        );

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PositionEvent::Opened(p) if p.id == "1"));
        assert!(tracked.contains_key("1"));
    }

    #[test]
    fn test_missing_position_emits_closed_with_last_snapshot() {
        let mut tracked = HashMap::new();
        tracked.insert(
            "1".to_string(),
            position("1", Decimal::new(10, 2), Decimal::new(42, 0)),
        );

        let events = diff_snapshots(&mut tracked, vec![], DEFAULT_PROFIT_NOISE);

        assert_eq!(events.len(), 1);
        match &events[0] {
            PositionEvent::Closed {
                position,
                close_info,
            } => {
                assert_eq!(position.profit, Decimal::new(42, 0));
                assert_eq!(close_info.reason, CloseReason::Closed);
                assert_eq!(close_info.profit, Decimal::ZERO);
            }
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(tracked.is_empty());
    }

    #[test]
    fn test_profit_jitter_below_noise_is_ignored() {
        let mut tracked = HashMap::new();
        tracked.insert(
            "1".to_string(),
            position("1", Decimal::new(10, 2), Decimal::ZERO),
        );

        let events = diff_snapshots(
            &mut tracked,
            vec![position("1", Decimal::new(10, 2), Decimal::new(30, 2))],
            DEFAULT_PROFIT_NOISE,
        );
        assert!(events.is_empty());

        let events = diff_snapshots(
            &mut tracked,
            vec![position("1", Decimal::new(10, 2), Decimal::new(500, 2))],
            DEFAULT_PROFIT_NOISE,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PositionEvent::Updated { .. }));
    }

    #[test]
    fn test_volume_change_always_emits_updated() {
        let mut tracked = HashMap::new();
        tracked.insert(
            "1".to_string(),
            position("1", Decimal::new(100, 2), Decimal::ZERO),
        );

        let events = diff_snapshots(
            &mut tracked,
            vec![position("1", Decimal::new(50, 2), Decimal::ZERO)],
            DEFAULT_PROFIT_NOISE,
        );

        assert_eq!(events.len(), 1);
        match &events[0] {
            PositionEvent::Updated { previous, current } => {
                assert_eq!(previous.volume, Decimal::new(100, 2));
                assert_eq!(current.volume, Decimal::new(50, 2));
            }
            other => panic!("expected Updated, got {other:?}"),
        }
    }
}
