//! Persisted source↔destination position correspondence.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Back-reference between a source position and the destination
/// position opened to mirror it. Value data only; never embeds the
/// broker-owned position objects themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMapping {
    pub source_account_id: String,
    pub source_position_id: String,
    pub dest_account_id: String,
    pub dest_position_id: String,
    pub symbol: String,
    pub source_volume: Decimal,
    pub dest_volume: Decimal,
    pub opened_at: DateTime<Utc>,
    pub source_open_price: Decimal,
    pub dest_open_price: Decimal,
}

/// Queued intent to close a mirrored destination position whose
/// source has already closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExit {
    pub mapping: PositionMapping,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl PendingExit {
    pub fn new(mapping: PositionMapping) -> Self {
        Self {
            mapping,
            queued_at: Utc::now(),
            retry_count: 0,
        }
    }
}
