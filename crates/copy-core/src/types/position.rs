//! Broker positions and close classification.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// A broker-held position as reported by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Broker-assigned position id.
    pub id: String,
    pub symbol: String,
    pub side: Side,
    /// Lots, two fractional digits.
    pub volume: Decimal,
    pub open_price: Decimal,
    #[serde(default)]
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub profit: Decimal,
    pub open_time: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub update_time: DateTime<Utc>,
    /// Free-form broker comment; carries the correlation id on copies.
    #[serde(default)]
    pub comment: Option<String>,
}

impl Position {
    /// Volume expressed in hundredths of a lot (0.50 lots -> 50).
    pub fn volume_centi(&self) -> i64 {
        volume_centi(self.volume)
    }
}

/// Lots to hundredths-of-a-lot, rounded to the nearest centi-lot.
pub fn volume_centi(volume: Decimal) -> i64 {
    (volume * Decimal::new(100, 0))
        .round()
        .to_i64()
        .unwrap_or(0)
}

/// Pip size for a symbol. Metals quote in tenths, JPY pairs in
/// hundredths, everything else in the usual fourth decimal.
pub fn pip_size(symbol: &str) -> Decimal {
    let upper = symbol.to_uppercase();
    if upper.contains("XAU") || upper.contains("XAG") {
        Decimal::new(1, 1) // 0.1
    } else if upper.contains("JPY") {
        Decimal::new(1, 2) // 0.01
    } else {
        Decimal::new(1, 4) // 0.0001
    }
}

/// Why a source position closed, as inferred from the close deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    StopOut,
    Manual,
    EaClose,
    Other,
    /// Authoritative close with no deal information available.
    Closed,
}

impl CloseReason {
    /// Classify a close from the broker's deal comment.
    pub fn classify(comment: &str) -> CloseReason {
        let upper = comment.to_uppercase();
        if upper.contains("TP") || upper.contains("TAKE PROFIT") {
            CloseReason::TakeProfit
        } else if upper.contains("SO:") || upper.contains("STOP OUT") || upper.contains("STOPOUT") {
            CloseReason::StopOut
        } else if upper.contains("SL") || upper.contains("STOP LOSS") {
            CloseReason::StopLoss
        } else if upper.contains("EA") || upper.contains("EXPERT") {
            CloseReason::EaClose
        } else if upper.contains("MANUAL") || upper.contains("CLIENT") {
            CloseReason::Manual
        } else {
            CloseReason::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "TP",
            CloseReason::StopLoss => "SL",
            CloseReason::StopOut => "STOP_OUT",
            CloseReason::Manual => "MANUAL",
            CloseReason::EaClose => "EA_CLOSE",
            CloseReason::Other => "OTHER",
            CloseReason::Closed => "CLOSED",
        }
    }
}

/// Close details attached to a terminal position event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseInfo {
    pub reason: CloseReason,
    pub profit: Decimal,
    pub deal_comment: Option<String>,
}

impl CloseInfo {
    /// Close with no deal available. Treated as authoritative but opaque.
    pub fn opaque() -> Self {
        Self {
            reason: CloseReason::Closed,
            profit: Decimal::ZERO,
            deal_comment: None,
        }
    }

    pub fn from_deal(comment: &str, profit: Decimal) -> Self {
        Self {
            reason: CloseReason::classify(comment),
            profit,
            deal_comment: Some(comment.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(volume: Decimal) -> Position {
        Position {
            id: "1001".to_string(),
            symbol: "XAUUSD".to_string(),
            side: Side::Buy,
            volume,
            open_price: Decimal::new(240000, 2),
            current_price: Decimal::new(240100, 2),
            stop_loss: None,
            take_profit: None,
            profit: Decimal::ZERO,
            open_time: Utc::now(),
            update_time: Utc::now(),
            comment: None,
        }
    }

    #[test]
    fn test_volume_centi() {
        assert_eq!(position(Decimal::new(50, 2)).volume_centi(), 50);
        assert_eq!(position(Decimal::new(1, 0)).volume_centi(), 100);
        assert_eq!(position(Decimal::new(133, 2)).volume_centi(), 133);
    }

    #[test]
    fn test_pip_size_by_symbol() {
        assert_eq!(pip_size("XAUUSD"), Decimal::new(1, 1));
        assert_eq!(pip_size("USDJPY"), Decimal::new(1, 2));
        assert_eq!(pip_size("EURUSD"), Decimal::new(1, 4));
    }

    #[test]
    fn test_close_reason_classification() {
        assert_eq!(CloseReason::classify("[tp]"), CloseReason::TakeProfit);
        assert_eq!(CloseReason::classify("[sl]"), CloseReason::StopLoss);
        assert_eq!(CloseReason::classify("so: margin call"), CloseReason::StopOut);
        assert_eq!(CloseReason::classify("closed by client"), CloseReason::Manual);
        assert_eq!(CloseReason::classify("EA close"), CloseReason::EaClose);
        assert_eq!(CloseReason::classify("partial fill"), CloseReason::Other);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }
}
