//! Rule sets: sizing policy, caps, and the filter list.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How destination volume is derived from source volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SizingMode {
    /// `dest = source * multiplier`.
    Proportional { multiplier: Decimal },
    /// Every copy uses the same lot size.
    Fixed { lots: Decimal },
    /// Degressive table keyed by source volume.
    Dynamic { tiers: Vec<DynamicTier> },
}

/// One row of a dynamic sizing table. The tier applies to source
/// volumes up to and including `base_lots`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicTier {
    pub base_lots: Decimal,
    pub multiplier: Decimal,
    pub max_lots: Decimal,
}

/// Named bundle of sizing, caps, and filters referenced by routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    pub name: String,
    pub sizing: SizingMode,
    pub max_daily_trades: u32,
    pub max_daily_loss: Decimal,
    pub min_time_between_trades_ms: i64,
    pub max_open_positions: usize,
    #[serde(default = "default_max_cycles")]
    pub max_concurrent_cycles: usize,
    pub filters: Vec<String>,
}

fn default_max_cycles() -> usize {
    3
}

impl RuleSet {
    /// Daily loss level at which sizing starts throttling down.
    pub fn soft_loss_threshold(&self) -> Decimal {
        self.max_daily_loss * Decimal::new(5, 1)
    }
}

/// Broker-enforced volume constraints applied after sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerLimits {
    pub min_lot: Decimal,
    pub max_lot: Decimal,
    pub lot_step: Decimal,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            min_lot: Decimal::new(1, 2),   // 0.01
            max_lot: Decimal::new(100, 0), // 100
            lot_step: Decimal::new(1, 2),  // 0.01
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_mode_tagged_parse() {
        let prop: SizingMode =
            serde_json::from_str(r#"{"type": "proportional", "multiplier": "2.0"}"#).unwrap();
        assert_eq!(
            prop,
            SizingMode::Proportional {
                multiplier: Decimal::new(20, 1)
            }
        );

        let fixed: SizingMode =
            serde_json::from_str(r#"{"type": "fixed", "lots": "0.10"}"#).unwrap();
        assert_eq!(
            fixed,
            SizingMode::Fixed {
                lots: Decimal::new(10, 2)
            }
        );
    }

    #[test]
    fn test_soft_loss_threshold_is_half_the_cap() {
        let rule = RuleSet {
            name: "r".to_string(),
            sizing: SizingMode::Fixed {
                lots: Decimal::new(10, 2),
            },
            max_daily_trades: 10,
            max_daily_loss: Decimal::new(2000, 0),
            min_time_between_trades_ms: 0,
            max_open_positions: 5,
            max_concurrent_cycles: 3,
            filters: vec![],
        };
        assert_eq!(rule.soft_loss_threshold(), Decimal::new(1000, 0));
    }
}
